//! Parsing and printing of SCRAM's comma-separated `k=v` attribute lists
//! (RFC 5802 §5), with the SASL-prep quoting RFC 5802 requires for
//! usernames (`=` -> `=3D`, `,` -> `=2C`).
//!
//! Grounded on the teacher's `client/auth/scram.rs` (`parse_kvp`, the
//! single-letter key constants) and cross-checked against
//! `examples/other_examples/..._jimberlage-rethinkdb.rs..connection.rs.rs`,
//! the one pack example that itself speaks this protocol.

use crate::{
    crypto::{base64_decode, base64_encode},
    error::{Error, Result},
};

/// An immutable SCRAM attribute list.
///
/// When parsed from wire input, [`ScramAttributes::to_string`] returns the
/// *original* input verbatim rather than a reserialization — per spec.md
/// §4.2 and the Open Question in §9, `AuthMessage` must be built from the
/// exact bytes the peers exchanged, not from a round-tripped
/// representation, even though the fields are parsed and validated
/// individually.
#[derive(Clone, Debug, Default)]
pub struct ScramAttributes {
    raw: Option<String>,
    n: Option<String>,
    r: Option<String>,
    s: Option<String>,
    i: Option<String>,
    c: Option<String>,
    p: Option<String>,
    v: Option<String>,
    e: Option<String>,
}

impl ScramAttributes {
    /// Parses a comma-separated `k=v` attribute list as received on the
    /// wire.
    pub fn parse(input: &str) -> Result<Self> {
        let mut attrs = ScramAttributes {
            raw: Some(input.to_string()),
            ..Default::default()
        };

        for section in input.split(',') {
            let mut parts = section.splitn(2, '=');
            let key = parts.next().unwrap_or_default();
            let value = parts.next().unwrap_or_default().to_string();

            match key {
                "m" => return Err(Error::auth("SCRAM", "m field disallowed")),
                "n" => attrs.n = Some(value),
                "r" => attrs.r = Some(value),
                "s" => attrs.s = Some(value),
                "i" => attrs.i = Some(value),
                "c" => attrs.c = Some(value),
                "p" => attrs.p = Some(value),
                "v" => attrs.v = Some(value),
                "e" => attrs.e = Some(value),
                _ => {} // unknown keys are ignored
            }
        }

        Ok(attrs)
    }

    /// Builds the client-first-message-bare attribute set: `n=<user>,r=<nonce>`.
    pub fn client_first(username: &str, nonce: &str) -> Self {
        ScramAttributes {
            n: Some(sasl_quote(username)),
            r: Some(nonce.to_string()),
            ..Default::default()
        }
    }

    /// Builds the client-final-message-without-proof attribute set:
    /// `c=<channel binding b64>,r=<nonce>`.
    pub fn client_final_without_proof(gs2_header: &str, nonce: &str) -> Self {
        ScramAttributes {
            c: Some(base64_encode(gs2_header.as_bytes())),
            r: Some(nonce.to_string()),
            ..Default::default()
        }
    }

    pub fn with_proof(mut self, proof: &[u8]) -> Self {
        self.p = Some(base64_encode(proof));
        self
    }

    pub fn nonce(&self) -> Option<&str> {
        self.r.as_deref()
    }

    pub fn salt(&self) -> Result<Vec<u8>> {
        let s = self.s.as_deref().ok_or_else(|| Error::invalid_response("SCRAM"))?;
        base64_decode(s).map_err(|_| Error::invalid_response("SCRAM"))
    }

    pub fn iterations(&self) -> Result<u32> {
        self.i
            .as_deref()
            .ok_or_else(|| Error::invalid_response("SCRAM"))?
            .parse()
            .map_err(|_| Error::auth("SCRAM", "iteration count invalid"))
    }

    pub fn proof(&self) -> Result<Vec<u8>> {
        let p = self.p.as_deref().ok_or_else(|| Error::invalid_response("SCRAM"))?;
        base64_decode(p).map_err(|_| Error::invalid_response("SCRAM"))
    }

    pub fn verifier(&self) -> Result<Vec<u8>> {
        let v = self.v.as_deref().ok_or_else(|| Error::invalid_response("SCRAM"))?;
        base64_decode(v).map_err(|_| Error::invalid_response("SCRAM"))
    }

    pub fn error(&self) -> Option<&str> {
        self.e.as_deref()
    }

    /// The `n=...,r=...` bare message this attribute set represents, used
    /// when this instance was constructed (not parsed) and needs to be
    /// embedded in the running `AuthMessage`.
    pub fn to_string(&self) -> String {
        if let Some(raw) = &self.raw {
            return raw.clone();
        }

        let mut parts = Vec::new();
        if let Some(n) = &self.n {
            parts.push(format!("n={}", n));
        }
        if let Some(r) = &self.r {
            parts.push(format!("r={}", r));
        }
        if let Some(c) = &self.c {
            parts.push(format!("c={}", c));
        }
        if let Some(p) = &self.p {
            parts.push(format!("p={}", p));
        }
        parts.join(",")
    }
}

/// SASL-quotes a username per RFC 5802 §5.1: `=` -> `=3D`, `,` -> `=2C`.
///
/// spec.md §9 notes the reference driver never applies SASLprep proper to
/// the *password*; this crate matches that (no `stringprep` dependency),
/// while still performing the mandatory structural quoting of the
/// username, which is a distinct, narrower requirement than SASLprep.
pub fn sasl_quote(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}
