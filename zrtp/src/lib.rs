/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
pub mod crypto;
pub mod crypto_impl;

pub mod application;
pub mod cache;
mod engine;
mod indexed_heap;
mod kdf;
mod packet;
pub mod profile;
mod protocol;

mod log_event;
pub use log_event::*;

pub mod proto;
pub mod registry;
pub mod result;
pub mod sas;
mod session;
mod zrtp;

#[cfg(all(test, feature = "default-crypto"))]
mod tests;

pub use crate::kdf::SecretBuf;
pub use crate::packet::{is_zrtp_packet, MessageType};
pub use crate::session::{MitmMode, Session, SessionInfo, StreamHandle, StreamInfo, StreamMode, StreamState};
pub use crate::zrtp::*;
