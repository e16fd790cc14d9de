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
//! Test sending GELF datagrams to port 12201 on the local host.

use gelf_tracing::{client::GelfClient, config::Config, layer::Layer};
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{
    layer::SubscriberExt, // Needed to get `with()`
    registry::Registry,
};

use std::sync::Arc;

pub fn main() {
    let client = Arc::new(
        GelfClient::new(&Config::builder("localhost").build().unwrap()).unwrap(),
    );
    // Setup the real subsriber...
    let subscriber = Registry::default().with(Layer::new(client.clone()).with_level_name(true));
    // and install it.
    {
        let _guard = tracing::subscriber::set_default(subscriber);

        trace!("Hello, 世界!");
        debug!("Hello, 世界!");
        info!(transport = "udp", "Hello, 世界!");
        warn!(transport = "udp", answer = 42, "Hello, 世界!");
        error!("Hello, 世界!\nThis one has a full message, too.");
        // Large enough to be chunked
        info!(padding = "x".repeat(20000).as_str(), "Hello, chunked 世界!");
    }

    match Arc::try_unwrap(client) {
        Ok(client) => {
            let report = client.shutdown();
            println!("{} messages dropped at shutdown", report.dropped);
        }
        Err(client) => println!("{}", client.stats()),
    }
}
