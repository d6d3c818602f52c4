use std::{
    borrow::Cow,
    collections::HashMap,
    fmt::{self, Display, Formatter},
    ops::{BitXor, Range},
    str,
    sync::RwLock,
};

use hmac::{digest::KeyInit, Hmac, Mac};
use lazy_static::lazy_static;
use md5::{Digest, Md5};
use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;
use sha2::Sha256;

use crate::{
    bson::Bson,
    client::auth::{
        self,
        sasl::{SaslContinue, SaslResponse, SaslStart},
        AuthMechanism,
        Credential,
    },
    cmap::conn::Connection,
    error::{Error, Result},
};

// The single letter attribute keys in SCRAM messages.
const ITERATION_COUNT_KEY: char = 'i';
const ERROR_KEY: char = 'e';
const PROOF_KEY: char = 'p';
const VERIFIER_KEY: char = 'v';
const NONCE_KEY: char = 'r';
const SALT_KEY: char = 's';
const CHANNEL_BINDING_KEY: char = 'c';
const USERNAME_KEY: char = 'n';

/// Constant specifying that we won't be using channel binding.
const NO_CHANNEL_BINDING: char = 'n';

/// The minimum number of iterations of the hash function that we will accept from the server.
/// Lower counts are rejected to prevent a tampering server from weakening the derived keys.
const MIN_ITERATION_COUNT: usize = 4096;

lazy_static! {
    /// Cache of pre-computed salted passwords.
    static ref CREDENTIAL_CACHE: RwLock<HashMap<CacheEntry, Vec<u8>>> = {
        RwLock::new(HashMap::new())
    };
}

#[derive(Hash, Eq, PartialEq)]
struct CacheEntry {
    password: String,
    salt: Vec<u8>,
    i: usize,
    mechanism: ScramVersion,
}

/// The versions of SCRAM supported by the driver (classified according to the hash function
/// used).
#[derive(Hash, Eq, PartialEq, Clone, Debug)]
pub(crate) enum ScramVersion {
    Sha1,
    Sha256,
}

impl ScramVersion {
    fn mechanism(&self) -> AuthMechanism {
        match self {
            ScramVersion::Sha1 => AuthMechanism::ScramSha1,
            ScramVersion::Sha256 => AuthMechanism::ScramSha256,
        }
    }

    /// Perform SCRAM authentication on the given connection.
    ///
    /// The conversation is a linear sequence of awaits; each round trip corresponds to one
    /// state of the exchange, so a failure names the round it happened in.
    pub(crate) async fn authenticate_connection(
        &self,
        conn: &mut Connection,
        credential: &Credential,
    ) -> Result<()> {
        let source = credential.source.as_str();

        let nonce = auth::generate_nonce();

        let client_first = ClientFirst::new(&credential.username, nonce.as_str());

        let command = SaslStart::new(
            source.to_string(),
            self.mechanism(),
            client_first.message().as_bytes().to_vec(),
        )
        .into_command();

        let server_first_response = conn.execute(command).await?;
        let server_first = ServerFirst::parse(SaslResponse::parse(
            self.as_str(),
            server_first_response.body,
        )?)?;
        server_first.validate(nonce.as_str())?;

        let cache_entry_key = CacheEntry {
            password: credential.password.clone(),
            salt: server_first.salt().to_vec(),
            i: server_first.i(),
            mechanism: self.clone(),
        };
        let (should_update_cache, salted_password) =
            match CREDENTIAL_CACHE.read().unwrap().get(&cache_entry_key) {
                Some(pwd) => (false, pwd.clone()),
                None => (
                    true,
                    self.compute_salted_password(
                        &credential.username,
                        &credential.password,
                        server_first.i(),
                        server_first.salt(),
                    )?,
                ),
            };

        let client_final = ClientFinal::new(
            salted_password.as_slice(),
            &client_first,
            &server_first,
            self,
        )?;

        let command = SaslContinue::new(
            source.to_string(),
            server_first.conversation_id().clone(),
            client_final.message().as_bytes().to_vec(),
        )
        .into_command();

        let server_final_response = conn.execute(command).await?;
        let server_final = ServerFinal::parse(SaslResponse::parse(
            self.as_str(),
            server_final_response.body,
        )?)?;
        server_final.validate(salted_password.as_slice(), &client_final, self)?;

        // The server honored `skipEmptyExchange` if it marked the previous exchange as done.
        // Otherwise a client no-op and a server no-op with `done: true` finish the
        // conversation.
        if !server_final.done() {
            let command = SaslContinue::new(
                source.to_string(),
                server_final.conversation_id().clone(),
                Vec::new(),
            )
            .into_command();

            let server_noop_response = conn.execute(command).await?;
            let server_noop =
                SaslResponse::parse(self.as_str(), server_noop_response.body)?;

            if crate::bson_util::get_int(&server_noop.conversation_id)
                != crate::bson_util::get_int(server_final.conversation_id())
            {
                return Err(Error::authentication_error(
                    self.as_str(),
                    "mismatched conversationId's",
                ));
            }

            if !server_noop.done {
                return Err(Error::invalid_authentication_response(self.as_str()));
            }
        }

        if should_update_cache {
            if let Ok(ref mut cache) = CREDENTIAL_CACHE.write() {
                if cache.get(&cache_entry_key).is_none() {
                    cache.insert(cache_entry_key, salted_password);
                }
            }
        }

        Ok(())
    }

    fn as_str(&self) -> &'static str {
        self.mechanism().as_str()
    }

    /// HMAC function used as part of SCRAM authentication.
    fn hmac(&self, key: &[u8], input: &[u8]) -> Result<Vec<u8>> {
        match self {
            ScramVersion::Sha1 => mac::<Hmac<Sha1>>(key, input),
            ScramVersion::Sha256 => mac::<Hmac<Sha256>>(key, input),
        }
    }

    /// Compute the HMAC of the given key and input and verify it matches the given signature.
    /// The comparison is constant-time.
    fn hmac_verify(&self, key: &[u8], input: &[u8], signature: &[u8]) -> Result<()> {
        match self {
            ScramVersion::Sha1 => mac_verify::<Hmac<Sha1>>(key, input, signature),
            ScramVersion::Sha256 => mac_verify::<Hmac<Sha256>>(key, input, signature),
        }
    }

    /// The "H" function defined in the SCRAM RFC.
    fn h(&self, str: &[u8]) -> Vec<u8> {
        match self {
            ScramVersion::Sha1 => hash::<Sha1>(str),
            ScramVersion::Sha256 => hash::<Sha256>(str),
        }
    }

    /// The "Hi" function as defined in the SCRAM RFC.
    fn h_i(&self, str: &str, salt: &[u8], iterations: usize) -> Vec<u8> {
        match self {
            ScramVersion::Sha1 => {
                let mut buf = vec![0u8; 160 / 8];
                pbkdf2_hmac::<Sha1>(str.as_bytes(), salt, iterations as u32, &mut buf);
                buf
            }
            ScramVersion::Sha256 => {
                let mut buf = vec![0u8; 256 / 8];
                pbkdf2_hmac::<Sha256>(str.as_bytes(), salt, iterations as u32, &mut buf);
                buf
            }
        }
    }

    /// Computes the salted password according to the SCRAM RFC and the MongoDB-specific
    /// password hashing algorithm.
    fn compute_salted_password(
        &self,
        username: &str,
        password: &str,
        i: usize,
        salt: &[u8],
    ) -> Result<Vec<u8>> {
        let normalized_password: Cow<'_, str> = match self {
            ScramVersion::Sha1 => {
                let mut md5 = Md5::new();
                md5.update(format!("{}:mongo:{}", username, password));
                Cow::Owned(hex::encode(md5.finalize()))
            }
            ScramVersion::Sha256 => match stringprep::saslprep(password) {
                Ok(p) => p,
                Err(_) => {
                    return Err(Error::authentication_error(
                        SCRAM_SHA_256_FAILURE_NAME,
                        "saslprep failure",
                    ))
                }
            },
        };

        Ok(self.h_i(normalized_password.as_ref(), salt, i))
    }
}

const SCRAM_SHA_256_FAILURE_NAME: &str = "SCRAM-SHA-256";

impl Display for ScramVersion {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn xor(lhs: &[u8], rhs: &[u8]) -> Vec<u8> {
    assert_eq!(lhs.len(), rhs.len());

    lhs.iter()
        .zip(rhs.iter())
        .map(|(l, r)| l.bitxor(r))
        .collect()
}

fn mac<M: Mac + KeyInit>(key: &[u8], input: &[u8]) -> Result<Vec<u8>> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|_| Error::authentication_error("SCRAM", "internal error"))?;
    mac.update(input);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn mac_verify<M: Mac + KeyInit>(key: &[u8], input: &[u8], signature: &[u8]) -> Result<()> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|_| Error::authentication_error("SCRAM", "internal error"))?;
    mac.update(input);
    mac.verify_slice(signature)
        .map_err(|_| Error::authentication_error("SCRAM", "authentication failed"))
}

fn hash<D: Digest>(val: &[u8]) -> Vec<u8> {
    let mut hash = D::new();
    hash.update(val);
    hash.finalize().to_vec()
}

/// Parses a string slice of the form "<expected_key>=<body>" into "<body>", if possible.
fn parse_kvp(str: &str, expected_key: char) -> Result<String> {
    let mut chars = str.chars();
    if chars.next() != Some(expected_key) || chars.next() != Some('=') {
        Err(Error::invalid_authentication_response("SCRAM"))
    } else {
        Ok(chars.collect())
    }
}

/// Model of the first message sent by the client.
struct ClientFirst {
    message: String,

    gs2_header: Range<usize>,

    bare: Range<usize>,
}

impl ClientFirst {
    fn new(username: &str, nonce: &str) -> Self {
        let gs2_header = format!("{},,", NO_CHANNEL_BINDING);
        let bare = format!("{}={},{}={}", USERNAME_KEY, username, NONCE_KEY, nonce);
        let full = format!("{}{}", &gs2_header, &bare);
        let end = full.len();
        ClientFirst {
            message: full,
            gs2_header: Range {
                start: 0,
                end: gs2_header.len(),
            },
            bare: Range {
                start: gs2_header.len(),
                end,
            },
        }
    }

    fn bare_message(&self) -> &str {
        &self.message[self.bare.clone()]
    }

    fn gs2_header(&self) -> &str {
        &self.message[self.gs2_header.clone()]
    }

    fn message(&self) -> &str {
        &self.message[..]
    }
}

/// Model of the first message received from the server.
///
/// This MUST be validated before sending the `ClientFinal` message back to the server.
struct ServerFirst {
    conversation_id: Bson,
    done: bool,
    message: String,
    nonce: String,
    salt: Vec<u8>,
    i: usize,
}

impl ServerFirst {
    fn parse(response: SaslResponse) -> Result<Self> {
        let message = str::from_utf8(&response.payload)
            .map_err(|_| Error::invalid_authentication_response("SCRAM"))?;

        let parts: Vec<&str> = message.split(',').collect();

        if parts.len() < 3 {
            return Err(Error::invalid_authentication_response("SCRAM"));
        };

        let full_nonce = parse_kvp(parts[0], NONCE_KEY)?;

        let salt = base64::decode(parse_kvp(parts[1], SALT_KEY)?.as_str())
            .map_err(|_| Error::invalid_authentication_response("SCRAM"))?;

        let i: usize = parse_kvp(parts[2], ITERATION_COUNT_KEY)?
            .parse()
            .map_err(|_| Error::authentication_error("SCRAM", "iteration count invalid"))?;

        Ok(ServerFirst {
            conversation_id: response.conversation_id,
            done: response.done,
            message: message.to_string(),
            nonce: full_nonce,
            salt,
            i,
        })
    }

    fn conversation_id(&self) -> &Bson {
        &self.conversation_id
    }

    fn message(&self) -> &str {
        self.message.as_str()
    }

    fn nonce(&self) -> &str {
        self.nonce.as_str()
    }

    fn salt(&self) -> &[u8] {
        self.salt.as_slice()
    }

    fn i(&self) -> usize {
        self.i
    }

    fn validate(&self, nonce: &str) -> Result<()> {
        if self.done {
            Err(Error::authentication_error(
                "SCRAM",
                "handshake terminated early",
            ))
        } else if !self.nonce.starts_with(nonce) {
            Err(Error::authentication_error("SCRAM", "mismatched nonce"))
        } else if self.i < MIN_ITERATION_COUNT {
            Err(Error::authentication_error(
                "SCRAM",
                "iteration count too low",
            ))
        } else {
            Ok(())
        }
    }
}

/// Model of the final message sent by the client.
///
/// Contains the "AuthMessage" mentioned in the RFC used in computing the client and server
/// signatures.
struct ClientFinal {
    message: String,
    auth_message: String,
    conversation_id: Bson,
}

impl ClientFinal {
    fn new(
        salted_password: &[u8],
        client_first: &ClientFirst,
        server_first: &ServerFirst,
        scram: &ScramVersion,
    ) -> Result<Self> {
        let client_key = scram.hmac(salted_password, b"Client Key")?;
        let stored_key = scram.h(client_key.as_slice());

        let without_proof = format!(
            "{}={},{}={}",
            CHANNEL_BINDING_KEY,
            base64::encode(client_first.gs2_header()),
            NONCE_KEY,
            server_first.nonce()
        );
        let auth_message = format!(
            "{},{},{}",
            client_first.bare_message(),
            server_first.message(),
            without_proof.as_str()
        );
        let client_signature = scram.hmac(stored_key.as_slice(), auth_message.as_bytes())?;
        let client_proof =
            base64::encode(xor(client_key.as_slice(), client_signature.as_slice()).as_slice());

        let message = format!("{},{}={}", without_proof, PROOF_KEY, client_proof);

        Ok(ClientFinal {
            message,
            auth_message,
            conversation_id: server_first.conversation_id().clone(),
        })
    }

    fn message(&self) -> &str {
        self.message.as_str()
    }

    fn auth_message(&self) -> &str {
        self.auth_message.as_str()
    }
}

enum ServerFinalBody {
    Error(String),
    Verifier(String),
}

/// Model of the final message received from the server.
///
/// This MUST be validated before the conversation is considered complete.
struct ServerFinal {
    conversation_id: Bson,
    done: bool,
    body: ServerFinalBody,
}

impl ServerFinal {
    fn parse(response: SaslResponse) -> Result<Self> {
        let message = str::from_utf8(&response.payload)
            .map_err(|_| Error::invalid_authentication_response("SCRAM"))?;

        let first = message
            .chars()
            .next()
            .ok_or_else(|| Error::invalid_authentication_response("SCRAM"))?;
        let body = if first == ERROR_KEY {
            let error = parse_kvp(message, ERROR_KEY)?;
            ServerFinalBody::Error(error)
        } else if first == VERIFIER_KEY {
            let verifier = parse_kvp(message, VERIFIER_KEY)?;
            ServerFinalBody::Verifier(verifier)
        } else {
            return Err(Error::invalid_authentication_response("SCRAM"));
        };

        Ok(ServerFinal {
            conversation_id: response.conversation_id,
            done: response.done,
            body,
        })
    }

    fn validate(
        &self,
        salted_password: &[u8],
        client_final: &ClientFinal,
        scram: &ScramVersion,
    ) -> Result<()> {
        if crate::bson_util::get_int(&self.conversation_id)
            != crate::bson_util::get_int(&client_final.conversation_id)
        {
            return Err(Error::authentication_error(
                "SCRAM",
                "mismatched conversationId's",
            ));
        };

        match self.body {
            ServerFinalBody::Verifier(ref body) => {
                let server_key = scram.hmac(salted_password, b"Server Key")?;
                let body_decoded = base64::decode(body.as_bytes())
                    .map_err(|_| Error::invalid_authentication_response("SCRAM"))?;

                scram.hmac_verify(
                    server_key.as_slice(),
                    client_final.auth_message().as_bytes(),
                    body_decoded.as_slice(),
                )
            }
            ServerFinalBody::Error(ref err) => {
                Err(Error::authentication_error("SCRAM", err.as_str()))
            }
        }
    }

    fn done(&self) -> bool {
        self.done
    }

    fn conversation_id(&self) -> &Bson {
        &self.conversation_id
    }
}

#[cfg(test)]
mod test {
    use super::{ClientFinal, ClientFirst, ScramVersion, ServerFinal, ServerFirst};
    use crate::{bson::Bson, client::auth::sasl::SaslResponse};

    fn sasl_response(payload: &str) -> SaslResponse {
        SaslResponse {
            conversation_id: Bson::Int32(1),
            done: false,
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[test]
    fn low_iteration_counts_are_rejected() {
        let nonce = "mocked";

        let invalid_iteration_count = ServerFirst {
            conversation_id: Bson::Int32(1),
            done: false,
            message: "mocked".to_string(),
            nonce: nonce.to_string(),
            salt: Vec::new(),
            i: 42,
        };
        assert!(invalid_iteration_count.validate(nonce).is_err());

        let valid_iteration_count = ServerFirst {
            i: 4096,
            ..invalid_iteration_count
        };
        assert!(valid_iteration_count.validate(nonce).is_ok())
    }

    // The SCRAM-SHA-256 example conversation from RFC 7677, section 3. MongoDB's SHA-256
    // variant applies SASLprep to the password, which leaves "pencil" untouched, so the
    // whole exchange matches the RFC vector.
    #[test]
    fn sha256_conversation_matches_rfc_7677_vector() {
        let scram = ScramVersion::Sha256;
        let nonce = "rOprNGfwEbeRWgbNEkqO";

        let client_first = ClientFirst::new("user", nonce);
        assert_eq!(client_first.message(), "n,,n=user,r=rOprNGfwEbeRWgbNEkqO");

        let server_first = ServerFirst::parse(sasl_response(
            "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
             s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096",
        ))
        .unwrap();
        server_first.validate(nonce).unwrap();

        let salted_password = scram
            .compute_salted_password("user", "pencil", server_first.i(), server_first.salt())
            .unwrap();

        let client_final =
            ClientFinal::new(&salted_password, &client_first, &server_first, &scram).unwrap();
        assert_eq!(
            client_final.message(),
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
             p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );

        let server_final = ServerFinal::parse(sasl_response(
            "v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=",
        ))
        .unwrap();
        server_final
            .validate(&salted_password, &client_final, &scram)
            .unwrap();

        // A tampered verifier must not pass.
        let forged = ServerFinal::parse(sasl_response(
            "v=5rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=",
        ))
        .unwrap();
        assert!(forged
            .validate(&salted_password, &client_final, &scram)
            .is_err());
    }

    #[test]
    fn sha1_password_is_md5_prehashed() {
        let scram = ScramVersion::Sha1;
        let salted = scram
            .compute_salted_password("user", "pencil", 4096, b"salt")
            .unwrap();
        // Hi() output length equals the SHA-1 digest length.
        assert_eq!(salted.len(), 20);
    }
}
