/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
#[cfg(feature = "ecc")]
mod ecdh_impl;
#[cfg(feature = "ecc")]
pub use ecdh_impl::*;
#[cfg(feature = "ecc")]
pub use {p256, p384, p521};

#[cfg(feature = "modp")]
mod modp_impl;
#[cfg(feature = "modp")]
pub use modp_impl::*;
#[cfg(feature = "modp")]
pub use num_bigint;

#[cfg(feature = "sha2")]
mod sha2_impl;
#[cfg(feature = "sha2")]
pub use hmac;
#[cfg(feature = "sha2")]
pub use sha2;
#[cfg(feature = "sha2")]
pub use sha2_impl::*;

#[cfg(feature = "aes")]
mod aes_impl;
#[cfg(feature = "aes")]
pub use aes;
#[cfg(feature = "aes")]
pub use aes_impl::*;

#[cfg(all(feature = "aes", feature = "sha2"))]
mod srtp_impl;
#[cfg(all(feature = "aes", feature = "sha2"))]
pub use srtp_impl::*;

/// Implement this trait instead of `CryptoLayer` to get the default RustCrypto backed
/// implementation of every primitive.
#[cfg(feature = "default-crypto")]
pub trait DefaultCrypto {
    type SessionData;
}
#[cfg(feature = "default-crypto")]
impl<C: DefaultCrypto> crate::application::CryptoLayer for C {
    type Rng = rand_core::OsRng;
    type Sha256 = CrateSha256;
    type Sha384 = CrateSha384;
    type HmacSha256 = CrateHmacSha256;
    type HmacSha384 = CrateHmacSha384;
    type HmacSha1 = CrateHmacSha1;
    type Aes = CrateAes;
    type Ec256 = CrateEc256;
    type Ec384 = CrateEc384;
    type Ec521 = CrateEc521;
    type Dh2048 = CrateDh2048;
    type Dh3072 = CrateDh3072;
    type Srtp = CrateSrtp;

    type SessionData = C::SessionData;
}

/// Default crypto with no session data, used by the unit tests.
#[cfg(all(test, feature = "default-crypto"))]
pub(crate) struct TestCrypto;
#[cfg(all(test, feature = "default-crypto"))]
impl DefaultCrypto for TestCrypto {
    type SessionData = u32;
}
