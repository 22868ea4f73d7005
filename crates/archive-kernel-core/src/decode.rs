use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::FieldMap;

const DECODE_TARGET: &str = "archive_kernel::decode";
const MAX_LEGACY_DEPTH: usize = 32;

/// Which decoding strategy produced a payload's field map, best first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DecodeQuality {
    Strict,
    Repaired,
    Legacy,
    Heuristic,
    None,
}

impl DecodeQuality {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Repaired => "repaired",
            Self::Legacy => "legacy",
            Self::Heuristic => "heuristic",
            Self::None => "none",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "strict" => Some(Self::Strict),
            "repaired" => Some(Self::Repaired),
            "legacy" => Some(Self::Legacy),
            "heuristic" => Some(Self::Heuristic),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_degraded(self) -> bool {
        self != Self::Strict
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedPayload {
    pub fields: FieldMap,
    pub quality: DecodeQuality,
}

impl DecodedPayload {
    #[must_use]
    pub fn empty() -> Self {
        Self { fields: FieldMap::new(), quality: DecodeQuality::None }
    }
}

type Strategy = fn(&str) -> Option<FieldMap>;

const STRATEGIES: [(DecodeQuality, Strategy); 4] = [
    (DecodeQuality::Strict, decode_strict),
    (DecodeQuality::Repaired, decode_repaired),
    (DecodeQuality::Legacy, decode_legacy),
    (DecodeQuality::Heuristic, decode_heuristic),
];

/// Best-effort decode of an archived payload.
///
/// Strategies run in order and the first non-empty field map wins. Malformed input is
/// never an error: when every strategy fails the result is an empty map with quality
/// [`DecodeQuality::None`]. Each escalation is logged under `archive_kernel::decode`.
#[must_use]
pub fn decode_payload(raw: &str) -> DecodedPayload {
    let trimmed = raw.trim_start_matches('\u{feff}').trim();
    if trimmed.is_empty() {
        tracing::warn!(target: DECODE_TARGET, "archived payload is empty");
        return DecodedPayload::empty();
    }

    for (quality, strategy) in STRATEGIES {
        if let Some(fields) = strategy(trimmed) {
            if quality.is_degraded() {
                tracing::warn!(
                    target: DECODE_TARGET,
                    quality = quality.as_str(),
                    fields = fields.len(),
                    "archived payload recovered with a degraded strategy"
                );
            }
            return DecodedPayload { fields, quality };
        }
        tracing::debug!(
            target: DECODE_TARGET,
            strategy = quality.as_str(),
            "decode strategy produced nothing; escalating"
        );
    }

    tracing::warn!(
        target: DECODE_TARGET,
        payload_len = raw.len(),
        "archived payload could not be decoded by any strategy"
    );
    DecodedPayload::empty()
}

fn non_empty(object: Map<String, Value>) -> Option<FieldMap> {
    if object.is_empty() {
        return None;
    }
    Some(object.into_iter().collect())
}

fn decode_strict(raw: &str) -> Option<FieldMap> {
    match serde_json::from_str::<Value>(raw).ok()? {
        Value::Object(object) => non_empty(object),
        _ => None,
    }
}

fn decode_repaired(raw: &str) -> Option<FieldMap> {
    // Double-encoded payloads parse as a JSON string whose content is the object.
    if let Ok(Value::String(inner)) = serde_json::from_str::<Value>(raw) {
        let inner = inner.trim();
        return decode_strict(inner).or_else(|| repair_and_parse(inner));
    }
    repair_and_parse(raw)
}

fn repair_and_parse(raw: &str) -> Option<FieldMap> {
    let mut text = raw.to_string();

    let quoted = text.len() >= 2
        && ((text.starts_with('"') && text.ends_with('"'))
            || (text.starts_with('\'') && text.ends_with('\'')));
    if quoted {
        text = text[1..text.len() - 1].to_string();
    }
    if text.contains("\\\"") {
        text = text.replace("\\\"", "\"");
    }
    if !text.contains('"') && text.contains('\'') {
        text = text.replace('\'', "\"");
    }
    if let Some(pattern) = unquoted_key_pattern() {
        text = pattern.replace_all(&text, "${1}\"${2}\":").into_owned();
    }
    if let Some(pattern) = trailing_comma_pattern() {
        text = pattern.replace_all(&text, "${1}").into_owned();
    }

    decode_strict(&text)
}

fn decode_legacy(raw: &str) -> Option<FieldMap> {
    let mut reader = LegacyReader { input: raw.as_bytes(), pos: 0 };
    match reader.parse_value(0)? {
        Value::Object(object) => non_empty(object),
        _ => None,
    }
}

fn decode_heuristic(raw: &str) -> Option<FieldMap> {
    let mut fields = FieldMap::new();

    // Length-corrupted legacy payloads still carry recognisable key/value pairs.
    if let Some(pattern) = legacy_pair_pattern() {
        for captures in pattern.captures_iter(raw) {
            let Some(key) = captures.get(1).map(|m| m.as_str().to_string()) else {
                continue;
            };
            let value = if let Some(text) = captures.get(2) {
                Value::String(text.as_str().to_string())
            } else if let Some(int) = captures.get(3) {
                int.as_str().parse::<i64>().map(Value::from).unwrap_or(Value::Null)
            } else if let Some(flag) = captures.get(4) {
                Value::Bool(flag.as_str() == "1")
            } else {
                Value::Null
            };
            fields.entry(key).or_insert(value);
        }
    }
    if !fields.is_empty() {
        return Some(fields);
    }

    let pattern = key_value_pattern()?;
    for captures in pattern.captures_iter(raw) {
        let Some(key) = captures.get(1).map(|m| m.as_str().to_string()) else {
            continue;
        };
        let value = captures
            .get(2)
            .or_else(|| captures.get(3))
            .map(|m| m.as_str().to_string())
            .or_else(|| captures.get(4).map(|m| m.as_str().trim().to_string()));
        let Some(value) = value else {
            continue;
        };
        let value = if value.eq_ignore_ascii_case("null") {
            Value::Null
        } else {
            Value::String(value)
        };
        fields.entry(key).or_insert(value);
    }

    if fields.is_empty() {
        None
    } else {
        Some(fields)
    }
}

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn unquoted_key_pattern() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&CELL, r"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:")
}

fn trailing_comma_pattern() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    cached(&CELL, r",\s*([}\]])")
}

fn legacy_pair_pattern() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    cached(
        &CELL,
        r#"s:\d+:"([A-Za-z_][A-Za-z0-9_]*)";\s*(?:s:\d+:"([^"]*)"|i:(-?\d+)|b:([01])|N)"#,
    )
}

fn key_value_pattern() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    cached(
        &CELL,
        r#"["']?([A-Za-z_][A-Za-z0-9_]*)["']?\s*(?:=>|[:=])\s*(?:"([^"]*)"|'([^']*)'|([^,;\r\n}\]]+))"#,
    )
}

/// Reader for the length-prefixed legacy object serialization
/// (`a:2:{s:4:"name";s:8:"Jane Doe";s:2:"id";i:42;}`).
struct LegacyReader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> LegacyReader<'a> {
    fn next_byte(&mut self) -> Option<u8> {
        let byte = *self.input.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    fn expect(&mut self, expected: u8) -> Option<()> {
        (self.next_byte()? == expected).then_some(())
    }

    fn read_until(&mut self, delimiter: u8) -> Option<&'a str> {
        let rest = self.input.get(self.pos..)?;
        let offset = rest.iter().position(|byte| *byte == delimiter)?;
        let slice = rest.get(..offset)?;
        self.pos += offset + 1;
        std::str::from_utf8(slice).ok()
    }

    fn read_string(&mut self) -> Option<String> {
        let len = self.read_until(b':')?.parse::<usize>().ok()?;
        self.expect(b'"')?;
        let end = self.pos.checked_add(len)?;
        let bytes = self.input.get(self.pos..end)?;
        self.pos = end;
        self.expect(b'"')?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    fn parse_value(&mut self, depth: usize) -> Option<Value> {
        if depth > MAX_LEGACY_DEPTH {
            return None;
        }
        match self.next_byte()? {
            b'N' => {
                self.expect(b';')?;
                Some(Value::Null)
            }
            b'b' => {
                self.expect(b':')?;
                match self.read_until(b';')? {
                    "0" => Some(Value::Bool(false)),
                    "1" => Some(Value::Bool(true)),
                    _ => None,
                }
            }
            b'i' => {
                self.expect(b':')?;
                self.read_until(b';')?.parse::<i64>().ok().map(Value::from)
            }
            b'd' => {
                self.expect(b':')?;
                let parsed = self.read_until(b';')?.parse::<f64>().ok()?;
                Some(Number::from_f64(parsed).map_or(Value::Null, Value::Number))
            }
            b's' => {
                self.expect(b':')?;
                let text = self.read_string()?;
                self.expect(b';')?;
                Some(Value::String(text))
            }
            b'a' => {
                self.expect(b':')?;
                let count = self.read_until(b':')?.parse::<usize>().ok()?;
                self.parse_entries(count, depth)
            }
            b'O' => {
                self.expect(b':')?;
                let _class_name = self.read_string()?;
                self.expect(b':')?;
                let count = self.read_until(b':')?.parse::<usize>().ok()?;
                self.parse_entries(count, depth)
            }
            _ => None,
        }
    }

    fn parse_entries(&mut self, count: usize, depth: usize) -> Option<Value> {
        self.expect(b'{')?;
        let mut entries = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            let key = match self.parse_value(depth + 1)? {
                Value::String(key) => strip_visibility_prefix(&key).to_string(),
                Value::Number(index) => index.to_string(),
                _ => return None,
            };
            let value = self.parse_value(depth + 1)?;
            entries.push((key, value));
        }
        self.expect(b'}')?;
        Some(entries_to_value(entries))
    }
}

/// Protected and private object properties carry a `\0...\0` prefix before the name.
fn strip_visibility_prefix(key: &str) -> &str {
    key.rsplit('\0').next().unwrap_or(key)
}

fn entries_to_value(entries: Vec<(String, Value)>) -> Value {
    let sequential = !entries.is_empty()
        && entries.iter().enumerate().all(|(index, (key, _))| key == &index.to_string());
    if sequential {
        return Value::Array(entries.into_iter().map(|(_, value)| value).collect());
    }
    Value::Object(entries.into_iter().collect())
}
