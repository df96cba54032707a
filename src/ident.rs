use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How key parts are joined before hashing.
///
/// `Concat` reproduces the identifiers already stored in existing catalogs:
/// parts are joined with no separator, so ("ab", "c") and ("a", "bc") collide.
/// `LengthPrefixed` writes each part as `<byte len>:<part>` and has no such
/// collision, but yields different identifiers for every row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyEncoding {
    #[default]
    Concat,
    LengthPrefixed,
}

impl KeyEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyEncoding::Concat => "concat",
            KeyEncoding::LengthPrefixed => "length_prefixed",
        }
    }
}

pub fn derive<I, S>(encoding: KeyEncoding, parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let part = part.as_ref();
        if encoding == KeyEncoding::LengthPrefixed {
            hasher.update(part.len().to_string().as_bytes());
            hasher.update(b":");
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

pub fn source_id(encoding: KeyEncoding, schema: &str, table: &str, field: &str) -> String {
    derive(encoding, [schema, table, field])
}

pub fn target_id(encoding: KeyEncoding, schema: &str, table: &str, field: &str) -> String {
    derive(encoding, [schema, table, field])
}

pub fn mapping_id(encoding: KeyEncoding, source_id: &str, target_id: &str) -> String {
    derive(encoding, [source_id, target_id])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concat_matches_plain_sha256_of_joined_parts() {
        // sha256("abc")
        assert_eq!(
            derive(KeyEncoding::Concat, ["a", "b", "c"]),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn derive_is_deterministic() {
        let a = source_id(KeyEncoding::Concat, "dbo", "Customer", "Email");
        let b = source_id(KeyEncoding::Concat, "dbo", "Customer", "Email");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn changing_any_part_changes_the_id() {
        let base = source_id(KeyEncoding::Concat, "dbo", "Customer", "Email");
        assert_ne!(base, source_id(KeyEncoding::Concat, "sales", "Customer", "Email"));
        assert_ne!(base, source_id(KeyEncoding::Concat, "dbo", "Client", "Email"));
        assert_ne!(base, source_id(KeyEncoding::Concat, "dbo", "Customer", "Phone"));
    }

    #[test]
    fn concat_collides_on_shifted_boundaries() {
        assert_eq!(
            source_id(KeyEncoding::Concat, "ab", "c", "x"),
            source_id(KeyEncoding::Concat, "a", "bc", "x"),
        );
    }

    #[test]
    fn length_prefixed_separates_shifted_boundaries() {
        assert_ne!(
            source_id(KeyEncoding::LengthPrefixed, "ab", "c", "x"),
            source_id(KeyEncoding::LengthPrefixed, "a", "bc", "x"),
        );
        assert_ne!(
            source_id(KeyEncoding::LengthPrefixed, "dbo", "Customer", "Email"),
            source_id(KeyEncoding::Concat, "dbo", "Customer", "Email"),
        );
    }

    #[test]
    fn mapping_id_composes_source_and_target() {
        let s = source_id(KeyEncoding::Concat, "dbo", "Customer", "Email");
        let t = target_id(KeyEncoding::Concat, "dw", "Cust", "Email");
        let m = mapping_id(KeyEncoding::Concat, &s, &t);
        assert_eq!(m, derive(KeyEncoding::Concat, [format!("{s}{t}")]));
        assert_ne!(m, mapping_id(KeyEncoding::Concat, &t, &s));
    }
}
