//! Drives the ReQL V1.0 handshake: magic number, SCRAM-SHA-256
//! client-first/server-first/client-final/server-final, over a fresh
//! socket before any query frames are exchanged.
//!
//! Grounded on the teacher's `ScramVersion::authenticate_stream` in
//! `client/auth/scram.rs` (the same five-message shape, adapted from
//! MongoDB's `saslStart`/`saslContinue` command round trip to ReQL's
//! length-implicit, NUL-terminated JSON messages), and on
//! `examples/other_examples/..._jimberlage-rethinkdb.rs..connection.rs.rs`'s
//! `handshake()` for the magic-number framing specific to this protocol.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    crypto,
    error::{Error, Result},
    proto::scram_attrs::ScramAttributes,
};

/// V1.0 handshake magic number, sent little-endian as the very first bytes
/// on a fresh connection.
pub const MAGIC_V1_0: u32 = 0x34c2bdc3;

const SUB_PROTOCOL_VERSION: u32 = 0;
const AUTH_METHOD: &str = "SCRAM-SHA-256";
const GS2_HEADER: &str = "n,,";
const CLIENT_NONCE_LEN: usize = 18;

#[derive(Serialize, Deserialize)]
struct ClientHandshakeMessage {
    protocol_version: u32,
    authentication_method: String,
    authentication: String,
}

#[derive(Serialize)]
struct ClientFinalMessage {
    authentication: String,
}

#[derive(Deserialize)]
struct ServerHandshakeReply {
    success: bool,
    authentication: Option<String>,
    error: Option<String>,
    error_code: Option<i64>,
}

/// Runs the handshake to completion on `stream`, leaving it ready for query
/// frames on success. On failure the caller must close the socket; no
/// partial handshake state survives the returned error.
pub async fn perform<S>(stream: &mut S, user: &str, password: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_u32_le(MAGIC_V1_0).await?;

    let client_nonce = crypto::random_nonce(CLIENT_NONCE_LEN);
    let client_first = ScramAttributes::client_first(user, &client_nonce);
    let client_first_bare = client_first.to_string();

    let first_message = ClientHandshakeMessage {
        protocol_version: SUB_PROTOCOL_VERSION,
        authentication_method: AUTH_METHOD.to_string(),
        authentication: format!("{}{}", GS2_HEADER, client_first_bare),
    };
    write_json_message(stream, &first_message).await?;

    let server_first_reply: ServerHandshakeReply = read_json_message(stream).await?;
    if !server_first_reply.success {
        return Err(Error::auth_with_code(
            "SCRAM-SHA-256",
            server_first_reply.error.unwrap_or_default(),
            server_first_reply.error_code.unwrap_or(-1),
        ));
    }
    let server_first_raw = server_first_reply
        .authentication
        .ok_or_else(|| Error::invalid_response("SCRAM-SHA-256"))?;
    let server_first = ScramAttributes::parse(&server_first_raw)?;

    let server_nonce = server_first
        .nonce()
        .ok_or_else(|| Error::invalid_response("SCRAM-SHA-256"))?;
    if !server_nonce.starts_with(client_nonce.as_str()) {
        return Err(Error::auth("SCRAM-SHA-256", "mismatched nonce"));
    }

    let iterations = server_first.iterations()?;
    if iterations < crypto::MIN_ITERATIONS {
        return Err(Error::auth("SCRAM-SHA-256", "iteration count too low"));
    }
    let salt = server_first.salt()?;

    let salted_password = crypto::pbkdf2_sha256(password.as_bytes(), &salt, iterations);
    let client_key = crypto::hmac_sha256(&salted_password, b"Client Key");
    let stored_key = crypto::sha256(&client_key);

    let without_proof = ScramAttributes::client_final_without_proof(GS2_HEADER, server_nonce);
    let without_proof_str = without_proof.to_string();

    // The AuthMessage is built from the exact bytes exchanged on the wire:
    // the client-first-bare we sent, the server-first string as received
    // (not reserialized), and the client-final-without-proof we're about
    // to send.
    let auth_message = format!(
        "{},{},{}",
        client_first_bare, server_first_raw, without_proof_str
    );

    let client_signature = crypto::hmac_sha256(&stored_key, auth_message.as_bytes());
    let client_proof = crypto::xor(&client_key, &client_signature);

    let server_key = crypto::hmac_sha256(&salted_password, b"Server Key");
    let expected_server_signature = crypto::hmac_sha256(&server_key, auth_message.as_bytes());

    let final_attrs = without_proof.with_proof(&client_proof);
    let final_message = ClientFinalMessage {
        authentication: final_attrs.to_string(),
    };
    write_json_message(stream, &final_message).await?;

    let server_final_reply: ServerHandshakeReply = read_json_message(stream).await?;
    if !server_final_reply.success {
        return Err(Error::auth_with_code(
            "SCRAM-SHA-256",
            server_final_reply.error.unwrap_or_default(),
            server_final_reply.error_code.unwrap_or(-1),
        ));
    }
    let server_final_raw = server_final_reply
        .authentication
        .ok_or_else(|| Error::invalid_response("SCRAM-SHA-256"))?;
    let server_final = ScramAttributes::parse(&server_final_raw)?;

    if let Some(err) = server_final.error() {
        return Err(Error::auth("SCRAM-SHA-256", err));
    }
    let server_signature = server_final.verifier()?;
    if !crypto::constant_time_eq(&server_signature, &expected_server_signature) {
        return Err(Error::auth("SCRAM-SHA-256", "invalid server signature"));
    }

    tracing::debug!("SCRAM-SHA-256 handshake completed");
    Ok(())
}

async fn write_json_message<S, T>(stream: &mut S, message: &T) -> Result<()>
where
    S: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(message)?;
    stream.write_all(&bytes).await?;
    stream.write_u8(0).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_json_message<S, T>(stream: &mut S) -> Result<T>
where
    S: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut buf = Vec::new();
    loop {
        let byte = stream.read_u8().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::auth("SCRAM-SHA-256", "connection closed during handshake")
            } else {
                Error::io(e)
            }
        })?;
        if byte == 0 {
            break;
        }
        buf.push(byte);
    }
    let text = String::from_utf8(buf).map_err(|_| Error::invalid_response("SCRAM-SHA-256"))?;
    serde_json::from_str(&text).map_err(Error::from)
}

#[cfg(test)]
mod test {
    use super::*;

    /// RFC 7677 test vector, reproduced in spec.md §8 scenario S2.
    #[tokio::test]
    async fn rfc7677_vector_produces_expected_client_proof() {
        let salt = crypto::base64_decode("W22ZaJ0SNY7soEsUEjb6gQ==").unwrap();
        let client_nonce = "rOprNGfwEbeRWgbNEkqO";
        let server_first_raw =
            "r=rOprNGfwEbeRWgbNEkqOMYE6M6.cpSB2pj1ZnqX,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";

        let client_first = ScramAttributes::client_first("user", client_nonce);
        let client_first_bare = client_first.to_string();

        let server_first = ScramAttributes::parse(server_first_raw).unwrap();
        let server_nonce = server_first.nonce().unwrap();
        assert!(server_nonce.starts_with(client_nonce));

        let salted_password = crypto::pbkdf2_sha256(b"pencil", &salt, 4096);
        let client_key = crypto::hmac_sha256(&salted_password, b"Client Key");
        let stored_key = crypto::sha256(&client_key);

        let without_proof = ScramAttributes::client_final_without_proof(GS2_HEADER, server_nonce);
        let auth_message = format!(
            "{},{},{}",
            client_first_bare,
            server_first_raw,
            without_proof.to_string()
        );

        let client_signature = crypto::hmac_sha256(&stored_key, auth_message.as_bytes());
        let client_proof = crypto::xor(&client_key, &client_signature);

        assert_eq!(
            crypto::base64_encode(&client_proof),
            "dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );
    }

    #[tokio::test]
    async fn full_handshake_succeeds_against_mock_server() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let mut magic = [0u8; 4];
            server.read_exact(&mut magic).await.unwrap();
            assert_eq!(u32::from_le_bytes(magic), MAGIC_V1_0);

            let _first: ClientHandshakeMessage = read_json_message(&mut server).await.unwrap();
            // Server chooses its own salt/iterations/nonce suffix for this test.
            let salt = crypto::base64_decode("W22ZaJ0SNY7soEsUEjb6gQ==").unwrap();
            let server_nonce_suffix = "serverpart";
            let client_nonce = extract_client_nonce(&_first.authentication);
            let full_nonce = format!("{}{}", client_nonce, server_nonce_suffix);
            let server_first_raw = format!(
                "r={},s={},i=4096",
                full_nonce,
                crypto::base64_encode(&salt)
            );
            write_json_message(
                &mut server,
                &ServerHandshakeReplyOut {
                    success: true,
                    authentication: Some(server_first_raw.clone()),
                },
            )
            .await
            .unwrap();

            let client_final: ClientFinalMessage = read_json_message(&mut server).await.unwrap();
            let final_attrs = ScramAttributes::parse(&client_final.authentication).unwrap();
            let proof = final_attrs.proof().unwrap();

            let salted_password = crypto::pbkdf2_sha256(b"pencil", &salt, 4096);
            let client_key = crypto::hmac_sha256(&salted_password, b"Client Key");
            let stored_key = crypto::sha256(&client_key);
            let without_proof =
                ScramAttributes::client_final_without_proof(GS2_HEADER, &full_nonce);
            let client_first_bare = format!("n=user,r={}", client_nonce);
            let auth_message = format!(
                "{},{},{}",
                client_first_bare,
                server_first_raw,
                without_proof.to_string()
            );
            let client_signature = crypto::hmac_sha256(&stored_key, auth_message.as_bytes());
            let expected_key = crypto::xor(&client_key, &client_signature);
            assert_eq!(expected_key, proof);

            let server_key = crypto::hmac_sha256(&salted_password, b"Server Key");
            let server_signature = crypto::hmac_sha256(&server_key, auth_message.as_bytes());
            write_json_message(
                &mut server,
                &ServerHandshakeReplyOut {
                    success: true,
                    authentication: Some(format!(
                        "v={}",
                        crypto::base64_encode(&server_signature)
                    )),
                },
            )
            .await
            .unwrap();
        });

        perform(&mut client, "user", "pencil").await.unwrap();
        server_task.await.unwrap();
    }

    #[derive(serde::Serialize)]
    struct ServerHandshakeReplyOut {
        success: bool,
        authentication: Option<String>,
    }

    fn extract_client_nonce(authentication: &str) -> String {
        // authentication looks like "n,,n=user,r=<nonce>"
        let bare = authentication.splitn(3, ',').nth(2).unwrap();
        let attrs = ScramAttributes::parse(bare).unwrap();
        attrs.nonce().unwrap().to_string()
    }
}
