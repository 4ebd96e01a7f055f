// Copyright The Courier Authors
// SPDX-License-Identifier: Apache-2.0

//! The message envelope carried by transports.
//!
//! Routing concerns (channel, partition, transmission mode) are typed
//! headers; anything else rides in the free-form entries.

use std::collections::HashMap;

use courier_config::ChannelName;

use crate::transport::Transmission;

/// Typed routing headers plus free-form entries.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    /// Channel the message is routed to.
    pub channel: Option<ChannelName>,
    /// Partition routing key within the channel.
    pub partition: Option<u32>,
    /// Whether the sender awaits delivery confirmation.
    pub transmission: Option<Transmission>,
    /// Application-defined headers.
    pub entries: HashMap<String, String>,
}

/// An envelope around a message body.
#[derive(Debug, Clone)]
pub struct Message<T> {
    headers: Headers,
    body: T,
}

impl<T> Message<T> {
    /// An envelope with empty headers.
    pub fn new(body: T) -> Self {
        Self {
            headers: Headers::default(),
            body,
        }
    }

    /// An envelope with the given headers.
    pub fn with_headers(headers: Headers, body: T) -> Self {
        Self { headers, body }
    }

    /// Sets the channel header.
    #[must_use]
    pub fn on_channel(mut self, channel: ChannelName) -> Self {
        self.headers.channel = Some(channel);
        self
    }

    /// Sets the partition header.
    #[must_use]
    pub fn on_partition(mut self, partition: u32) -> Self {
        self.headers.partition = Some(partition);
        self
    }

    /// Sets the transmission header.
    #[must_use]
    pub fn transmitted(mut self, transmission: Transmission) -> Self {
        self.headers.transmission = Some(transmission);
        self
    }

    /// Adds a free-form header entry.
    #[must_use]
    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.headers.entries.insert(key.into(), value.into());
        self
    }

    /// The envelope headers.
    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The message body.
    #[must_use]
    pub fn body(&self) -> &T {
        &self.body
    }

    /// Unwraps the envelope.
    pub fn into_body(self) -> T {
        self.body
    }
}
