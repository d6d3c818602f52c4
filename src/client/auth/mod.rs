//! Contains the types needed to specify the auth configuration for a
//! [`Client`](crate::Client).

pub(crate) mod sasl;
pub(crate) mod scram;

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use derivative::Derivative;
use rand::Rng;

use crate::{
    cmap::conn::Connection,
    error::{Error, Result},
};

const SCRAM_SHA_1_STR: &str = "SCRAM-SHA-1";
const SCRAM_SHA_256_STR: &str = "SCRAM-SHA-256";

/// The authentication mechanisms supported by this driver.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum AuthMechanism {
    /// The SCRAM-SHA-1 mechanism as defined in
    /// [RFC 5802](http://tools.ietf.org/html/rfc5802).
    ScramSha1,

    /// The SCRAM-SHA-256 mechanism which extends
    /// [RFC 5802](http://tools.ietf.org/html/rfc5802) and is formally defined in
    /// [RFC 7677](https://tools.ietf.org/html/rfc7677).
    ScramSha256,
}

impl AuthMechanism {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            AuthMechanism::ScramSha1 => SCRAM_SHA_1_STR,
            AuthMechanism::ScramSha256 => SCRAM_SHA_256_STR,
        }
    }
}

impl FromStr for AuthMechanism {
    type Err = Error;

    fn from_str(str: &str) -> Result<Self> {
        match str {
            SCRAM_SHA_1_STR => Ok(AuthMechanism::ScramSha1),
            SCRAM_SHA_256_STR => Ok(AuthMechanism::ScramSha256),
            other => Err(Error::unsupported_auth_mechanism(other)),
        }
    }
}

impl Display for AuthMechanism {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A struct containing authentication information.
#[derive(Clone, Derivative, PartialEq)]
#[derivative(Debug)]
pub struct Credential {
    /// The username to authenticate with.
    pub username: String,

    /// The password to authenticate with.
    #[derivative(Debug = "ignore")]
    pub password: String,

    /// The database used to look up this user's credentials.
    pub source: String,

    /// Which authentication mechanism to use.
    pub mechanism: AuthMechanism,
}

/// Generates the random client contribution to a SCRAM nonce: 24 bytes of entropy,
/// base64-encoded.
pub(crate) fn generate_nonce() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill(&mut bytes[..]);
    base64::encode(bytes)
}

/// Authenticates a freshly handshaked connection according to the given credential.
///
/// This runs on the connection-establishment path and never attaches session or transaction
/// metadata to the commands it sends.
pub(crate) async fn authenticate_connection(
    conn: &mut Connection,
    credential: &Credential,
) -> Result<()> {
    match credential.mechanism {
        AuthMechanism::ScramSha1 => {
            scram::ScramVersion::Sha1
                .authenticate_connection(conn, credential)
                .await
        }
        AuthMechanism::ScramSha256 => {
            scram::ScramVersion::Sha256
                .authenticate_connection(conn, credential)
                .await
        }
    }
}

#[cfg(test)]
mod test {
    use super::generate_nonce;

    #[test]
    fn nonce_has_24_bytes_of_entropy() {
        let nonce = generate_nonce();
        assert_eq!(base64::decode(nonce).unwrap().len(), 24);
    }
}
