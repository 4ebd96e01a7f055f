// Copyright The Courier Authors
// SPDX-License-Identifier: Apache-2.0

//! Validated names and routing defaults shared across the courier broker.
//!
//! The broker core never relies on ambient defaults: the constants below are
//! passed explicitly wherever a channel, group, or partition is optional.

mod name;

pub use name::{ChannelName, GroupName, NameError};

/// Channel used when a message carries no `channel` header.
pub const DEFAULT_CHANNEL: &str = "default-channel";

/// Consumer group used when a consumer names none.
pub const DEFAULT_GROUP: &str = "default-group";

/// Partition used when a push names none.
pub const DEFAULT_PARTITION: u32 = 1;
