//! Domain model module declarations.

use serde::{Deserialize, Deserializer, Serializer};

pub mod command;
pub mod graph;
pub mod session;
pub mod tensor;
pub mod watchpoint;

/// Identifier of a compute unit (rank) participating in a run.
pub type DeviceId = String;

/// Serde adapter encoding optional raw byte buffers as base64 strings.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;

    use super::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }

    /// Same encoding for `Option<Bytes>`; `None` becomes JSON `null`.
    pub(crate) mod option {
        use super::{Bytes, Deserialize, Deserializer, Serializer, STANDARD};
        use base64::Engine as _;

        #[allow(clippy::ref_option)] // Signature dictated by `serde(with)`.
        pub(crate) fn serialize<S>(value: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
                None => serializer.serialize_none(),
            }
        }

        pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Option<Bytes>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let encoded = Option::<String>::deserialize(deserializer)?;
            encoded
                .map(|text| {
                    STANDARD
                        .decode(text.as_bytes())
                        .map(Bytes::from)
                        .map_err(serde::de::Error::custom)
                })
                .transpose()
        }
    }
}
