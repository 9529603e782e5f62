//! Persisted record types and the `stored_object!` macro that generates the
//! boilerplate (id, timestamps, `StoredObject` impl) shared by all of them.

pub mod chunk;
pub mod document;
pub mod knowledge_event;
pub mod llm_log;
pub mod settings;

use serde::{de::Error as _, Deserialize, Deserializer, Serialize};

/// Anything that can be stored in and retrieved from a `SurrealDbClient`
/// table via the generic CRUD helpers.
pub trait StoredObject: Serialize + for<'de> Deserialize<'de> + Clone + std::fmt::Debug {
    fn table_name() -> &'static str;
    fn get_id(&self) -> String;
}

/// SurrealDB returns record ids as `table:id` "Thing" values on select, but
/// accepts a plain string on insert. This accepts both shapes so a struct
/// round-trips through `SELECT` and `CREATE ... CONTENT` alike.
pub fn deserialize_flexible_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdOrThing {
        Id(String),
        Thing { id: IdInner },
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdInner {
        Str(String),
        Other(serde_json::Value),
    }

    match IdOrThing::deserialize(deserializer)? {
        IdOrThing::Id(s) => Ok(s),
        IdOrThing::Thing { id } => match id {
            IdInner::Str(s) => Ok(s),
            IdInner::Other(v) => v
                .as_str()
                .map(ToOwned::to_owned)
                .or_else(|| v.get("String").and_then(|s| s.as_str()).map(ToOwned::to_owned))
                .ok_or_else(|| D::Error::custom("unsupported record id shape")),
        },
    }
}

/// Generates a persisted record type: an `id` field with flexible
/// deserialization, `created_at`/`updated_at` timestamps, and a
/// `StoredObject` impl binding it to `$table`.
#[macro_export]
macro_rules! stored_object {
    ($name:ident, $table:expr, { $($field:ident : $ty:ty),* $(,)? }) => {
        #[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
        pub struct $name {
            #[serde(default, deserialize_with = "$crate::storage::types::deserialize_flexible_id")]
            pub id: String,
            $(pub $field: $ty,)*
            pub created_at: chrono::DateTime<chrono::Utc>,
            pub updated_at: chrono::DateTime<chrono::Utc>,
        }

        impl $crate::storage::types::StoredObject for $name {
            fn table_name() -> &'static str {
                $table
            }

            fn get_id(&self) -> String {
                self.id.clone()
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    stored_object!(Dummy, "dummy", { name: String });

    #[test]
    fn table_name_and_id_roundtrip() {
        let d = Dummy {
            id: "abc".to_string(),
            name: "x".to_string(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        assert_eq!(Dummy::table_name(), "dummy");
        assert_eq!(d.get_id(), "abc");
    }
}
