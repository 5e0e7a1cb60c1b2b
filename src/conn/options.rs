//! Per-connection configuration.
//!
//! Grounded on the teacher's `client::options::ClientOptions` (a
//! `TypedBuilder` struct with per-field defaults and `#[builder(default)]`
//! annotations, mirrored by a hand-written [`Default`] impl for the
//! documented defaults) cut down to the handful of knobs spec.md §5 names:
//! host/port/db/user/password, `connect_timeout`, TLS, and the maximum
//! frame length.

use std::{sync::Arc, time::Duration};

use typed_builder::TypedBuilder;

use crate::codec::{Codec, JsonCodec};

/// Default host a fresh [`ConnectionOptions`] connects to.
pub const DEFAULT_HOST: &str = "localhost";
/// Default ReQL driver port.
pub const DEFAULT_PORT: u16 = 28015;
/// Default database selected for queries that don't name one explicitly.
pub const DEFAULT_DB: &str = "test";
/// Default user, matching a fresh RethinkDB install's admin account.
pub const DEFAULT_USER: &str = "admin";

/// Configuration for a single [`Connection`](crate::conn::Connection).
///
/// spec.md §5: host, port, db, user, password, `connect_timeout`, TLS,
/// codec override.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ConnectionOptions {
    /// Hostname or IP address to connect to.
    #[builder(default_code = "DEFAULT_HOST.to_string()")]
    pub host: String,

    /// TCP port to connect to.
    #[builder(default_code = "DEFAULT_PORT")]
    pub port: u16,

    /// Database selected for queries that don't specify one.
    #[builder(default_code = "DEFAULT_DB.to_string()")]
    pub db: String,

    /// Username presented during the SCRAM-SHA-256 handshake.
    #[builder(default_code = "DEFAULT_USER.to_string()")]
    pub user: String,

    /// Password presented during the SCRAM-SHA-256 handshake.
    #[builder(default)]
    pub password: String,

    /// Deadline for the TCP connect plus handshake. `None` disables the
    /// deadline.
    #[builder(default, setter(strip_option))]
    pub connect_timeout: Option<Duration>,

    /// Maximum accepted incoming frame payload length, in bytes.
    #[builder(default_code = "crate::proto::frame::DEFAULT_MAX_FRAME_LEN")]
    pub max_frame_len: u32,

    /// TLS configuration. `None` connects over a bare TCP socket.
    #[builder(default)]
    pub tls: Option<TlsOptions>,

    /// Codec used to normalize decoded rows (and, for an AST layer built on
    /// top, to encode POJO query arguments). Defaults to [`JsonCodec`].
    #[builder(default_code = "Arc::new(JsonCodec) as Arc<dyn Codec>")]
    pub codec: Arc<dyn Codec>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions::builder().build()
    }
}

/// TLS configuration for a [`ConnectionOptions`].
///
/// Only present when the crate's `rustls-tls` feature is enabled; carries
/// the options a `rustls::ClientConfig` needs without forcing every caller
/// to depend on `rustls` directly.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
pub struct TlsOptions {
    /// Overrides the server name used for certificate verification; falls
    /// back to [`ConnectionOptions::host`] when unset.
    #[builder(setter(strip_option))]
    pub server_name: Option<String>,
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_documented_values() {
        let opts = ConnectionOptions::default();
        assert_eq!(opts.host, "localhost");
        assert_eq!(opts.port, 28015);
        assert_eq!(opts.db, "test");
        assert_eq!(opts.user, "admin");
        assert_eq!(opts.password, "");
        assert!(opts.connect_timeout.is_none());
        assert!(opts.tls.is_none());
    }

    #[test]
    fn builder_overrides_individual_fields() {
        let opts = ConnectionOptions::builder()
            .host("db.example.com")
            .port(28016u16)
            .db("app")
            .user("app_user")
            .password("hunter2")
            .connect_timeout(Duration::from_secs(5))
            .build();
        assert_eq!(opts.host, "db.example.com");
        assert_eq!(opts.port, 28016);
        assert_eq!(opts.connect_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn codec_defaults_to_json_codec_and_can_be_overridden() {
        #[derive(Debug)]
        struct PassthroughCodec;
        impl Codec for PassthroughCodec {
            fn encode_value(&self, value: serde_json::Value) -> crate::error::Result<serde_json::Value> {
                Ok(value)
            }
            fn decode_value(&self, value: serde_json::Value) -> crate::error::Result<serde_json::Value> {
                Ok(value)
            }
        }

        let defaulted = ConnectionOptions::default();
        assert_eq!(
            defaulted.codec.decode_value(serde_json::json!(1)).unwrap(),
            serde_json::json!(1)
        );

        let overridden = ConnectionOptions::builder()
            .codec(Arc::new(PassthroughCodec) as Arc<dyn Codec>)
            .build();
        let tagged = serde_json::json!({"$reql_type$": "TIME", "epoch_time": 1.0, "timezone": "+00:00"});
        // The override is a true passthrough: no pseudotype normalization.
        assert_eq!(overridden.codec.decode_value(tagged.clone()).unwrap(), tagged);
    }
}
