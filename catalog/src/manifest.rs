//! The manifest is the entry point to a repository revision: it names
//! the root catalog's content hash and the revision counter.
use crate::digests::ContentHash;
use crate::errors::Error;

/// The record produced by a successful commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    root_hash: ContentHash,
    revision: u64,
    timestamp: i64,
    schema: Option<String>,
}

impl Manifest {
    pub fn new(root_hash: ContentHash, revision: u64, timestamp: i64) -> Self {
        Self {
            root_hash,
            revision,
            timestamp,
            schema: Some("2.0".to_string()),
        }
    }

    pub fn root_hash(&self) -> &ContentHash {
        &self.root_hash
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Renders the key-value text form: one line per field, keyed by
    /// its first character, terminated by `--`.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("C{}\n", self.root_hash.to_hex()));
        out.push_str(&format!("S{}\n", self.revision));
        out.push_str(&format!("T{}\n", self.timestamp));
        if let Some(schema) = &self.schema {
            out.push_str(&format!("M{}\n", schema));
        }
        out.push_str("--\n");
        out
    }

    /// Parses the key-value text form produced by [Manifest::to_text].
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut root_hash = None;
        let mut revision = None;
        let mut timestamp = None;
        let mut schema = None;

        for line in text.lines() {
            if line == "--" {
                break;
            }
            if line.is_empty() || !line.is_char_boundary(1) {
                continue;
            }
            let (key, tail) = line.split_at(1);
            match key {
                "C" => {
                    root_hash = Some(ContentHash::from_hex(tail).map_err(|e| {
                        Error::Storage(format!("malformed manifest hash: {}", e))
                    })?)
                }
                "S" => {
                    revision = Some(tail.parse::<u64>().map_err(|_| {
                        Error::Storage(format!("malformed manifest revision '{}'", tail))
                    })?)
                }
                "T" => {
                    timestamp = Some(tail.parse::<i64>().map_err(|_| {
                        Error::Storage(format!("malformed manifest timestamp '{}'", tail))
                    })?)
                }
                "M" => schema = Some(tail.to_string()),
                // Unknown keys are skipped for forward compatibility.
                _ => {}
            }
        }

        Ok(Self {
            root_hash: root_hash
                .ok_or_else(|| Error::Storage("manifest lacks a root hash".to_string()))?,
            revision: revision
                .ok_or_else(|| Error::Storage("manifest lacks a revision".to_string()))?,
            timestamp: timestamp
                .ok_or_else(|| Error::Storage("manifest lacks a timestamp".to_string()))?,
            schema,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_round_trip() {
        let manifest = Manifest::new(ContentHash::of_bytes(b"root"), 17, 1700000000);
        let parsed = Manifest::parse(&manifest.to_text()).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn parse_skips_unknown_keys() {
        let hash = ContentHash::of_bytes(b"root");
        let text = format!("C{}\nS3\nT99\nXignored\n--\ntrailing garbage\n", hash.to_hex());
        let parsed = Manifest::parse(&text).unwrap();
        assert_eq!(parsed.revision(), 3);
        assert_eq!(parsed.timestamp(), 99);
        assert_eq!(parsed.schema(), None);
        assert_eq!(parsed.root_hash(), &hash);
    }

    #[test]
    fn parse_requires_core_fields() {
        assert!(Manifest::parse("S3\nT9\n--\n").is_err());
    }
}
