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
//! Test writing to a GELF TLS input on port 12201 on the local host.
//!
//! Usage: `tls-test [CA-PEM-FILE]`; with no CA file, certificate verification is disabled.

use gelf_tracing::{
    client::GelfClient,
    config::{Config, TransportMode},
    layer::Layer,
    tls::TlsSettings,
};
use tracing::{error, info, warn};
use tracing_subscriber::{
    layer::SubscriberExt, // Needed to get `with()`
    registry::Registry,
};

use std::sync::Arc;

pub fn main() {
    let tls = match std::env::args().nth(1) {
        Some(ca) => TlsSettings::new().native_roots(false).trust(ca),
        None => TlsSettings::new().insecure(true),
    };
    let config = Config::builder("localhost")
        .mode(TransportMode::Tls(tls))
        .build()
        .unwrap();
    let client = Arc::new(GelfClient::new(&config).unwrap());
    {
        let subscriber = Registry::default().with(Layer::new(client.clone()).with_caller(true));
        let _guard = tracing::subscriber::set_default(subscriber);

        info!("Hello, TLS.");
        warn!(secure = true, "Hello, TLS.");
        error!("Hello, TLS.");
    }

    match Arc::try_unwrap(client) {
        Ok(client) => {
            let report = client.shutdown();
            println!("{} messages dropped at shutdown", report.dropped);
        }
        Err(client) => println!("{}", client.stats()),
    }
}
