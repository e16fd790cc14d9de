// Copyright (C) 2022-2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of gelf-tracing.
//
// gelf-tracing is free software: you can redistribute it and/or modify it under the terms of the
// GNU General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// gelf-tracing is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with gelf-tracing.  If
// not, see <http://www.gnu.org/licenses/>.
//! Test writing to a GELF TCP input on port 12201 on the local host.

use gelf_tracing::{
    client::GelfClient,
    config::{Config, TransportMode},
    layer::Layer,
};
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{
    layer::SubscriberExt, // Needed to get `with()`
    registry::Registry,
};

use std::sync::Arc;

pub fn main() {
    let config = Config::builder("localhost")
        .mode(TransportMode::Tcp)
        .retry_buffer(64)
        .build()
        .unwrap();
    let client = Arc::new(GelfClient::new(&config).unwrap());
    {
        let subscriber = Registry::default().with(Layer::new(client.clone()));
        let _guard = tracing::subscriber::set_default(subscriber);

        trace!("你好, TCP socket.");
        debug!("你好, TCP socket.");
        info!("你好, TCP socket.");
        warn!("你好, TCP socket.");
        error!("你好, TCP socket.");
    }

    match Arc::try_unwrap(client) {
        Ok(client) => {
            let report = client.shutdown();
            println!("{} messages dropped at shutdown", report.dropped);
        }
        Err(client) => println!("{}", client.stats()),
    }
}
