//! Best-effort decoding of ZIP file names.
//!
//! Legacy archivers store names in whatever code page the machine used, with
//! nothing in the archive saying which. A statistical detector proposes
//! candidate encodings; [`select_charset`] picks one with a bias toward the
//! GB and UTF families and falls back to GB2312.

use std::fmt;

use chardetng::EncodingDetector;
use encoding_rs::{Encoding, GBK, UTF_8};

/// Encoding used when no candidate is convincing.
pub const FALLBACK_ENCODING: &str = "GB2312";

/// Minimum confidence for a GB/UTF-family candidate.
const FAMILY_THRESHOLD: f32 = 0.5;
/// Minimum confidence for any other allowed candidate.
const ANY_THRESHOLD: f32 = 0.8;

/// Legacy encodings accepted out of the box, besides the GB/UTF families.
const DEFAULT_LEGACY_ENCODINGS: &[&str] = &[
    "Big5",
    "Shift_JIS",
    "EUC-JP",
    "ISO-2022-JP",
    "EUC-KR",
    "windows-1250",
    "windows-1251",
    "windows-1252",
    "windows-1253",
    "windows-1254",
    "windows-1255",
    "windows-1256",
    "windows-1257",
    "windows-1258",
    "windows-874",
    "ISO-8859-2",
    "ISO-8859-5",
    "ISO-8859-7",
    "ISO-8859-8",
    "KOI8-R",
    "KOI8-U",
    "IBM866",
];

/// GB and UTF family encodings the decoder can handle.
const DEFAULT_FAMILY_ENCODINGS: &[&str] = &[
    "UTF-8", "UTF-16LE", "UTF-16BE", "GB2312", "GBK", "gb18030",
];

/// One guess from a detector.
#[derive(Debug, Clone, PartialEq)]
pub struct CharsetCandidate {
    pub encoding: String,
    pub confidence: f32,
}

impl CharsetCandidate {
    pub fn new(encoding: impl Into<String>, confidence: f32) -> Self {
        Self {
            encoding: encoding.into(),
            confidence,
        }
    }

    fn is_preferred_family(&self) -> bool {
        let upper = self.encoding.to_ascii_uppercase();
        upper.contains("GB") || upper.contains("UTF")
    }
}

/// Encoding chosen for a name.
#[derive(Debug, Clone, PartialEq)]
pub struct CharsetChoice {
    pub encoding: String,
    pub confidence: f32,
}

impl fmt::Display for CharsetChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:.2})", self.encoding, self.confidence)
    }
}

/// Statistical charset detector.
pub trait CharsetDetector: Send + Sync {
    /// Candidate encodings for `bytes`, in no particular order.
    fn detect(&self, bytes: &[u8]) -> Vec<CharsetCandidate>;
}

/// Detector built on `chardetng`.
///
/// `chardetng` yields a single guess plus a confidence flag, which is mapped
/// to 0.9 (confident) or 0.4 (not). Valid non-ASCII UTF-8 is reported as an
/// additional near-certain candidate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChardetngDetector;

impl CharsetDetector for ChardetngDetector {
    fn detect(&self, bytes: &[u8]) -> Vec<CharsetCandidate> {
        if bytes.is_ascii() {
            return vec![CharsetCandidate::new(UTF_8.name(), 1.0)];
        }

        let mut candidates = Vec::new();
        if std::str::from_utf8(bytes).is_ok() {
            candidates.push(CharsetCandidate::new(UTF_8.name(), 0.99));
        }

        let mut detector = EncodingDetector::new();
        detector.feed(bytes, true);
        let (encoding, confident) = detector.guess_assess(None, false);
        candidates.push(CharsetCandidate::new(
            encoding.name(),
            if confident { 0.9 } else { 0.4 },
        ));
        candidates
    }
}

/// Encodings a detector result may be accepted for.
#[derive(Debug, Clone)]
pub struct AllowList {
    names: Vec<String>,
}

impl AllowList {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Default legacy and GB/UTF encodings plus `extra`.
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list = Self::default();
        list.names.extend(extra.into_iter().map(Into::into));
        list
    }

    pub fn allows(&self, encoding: &str) -> bool {
        self.names.iter().any(|n| n.eq_ignore_ascii_case(encoding))
    }
}

impl Default for AllowList {
    fn default() -> Self {
        Self::new(
            DEFAULT_LEGACY_ENCODINGS
                .iter()
                .chain(DEFAULT_FAMILY_ENCODINGS)
                .copied(),
        )
    }
}

/// Pick an encoding from detector candidates.
///
/// 1. Best allowed GB/UTF-family candidate, if its confidence exceeds 0.5.
/// 2. Otherwise the best allowed candidate, if its confidence exceeds 0.8.
/// 3. Otherwise GB2312 with confidence 0.
pub fn select_charset(candidates: &[CharsetCandidate], allow: &AllowList) -> CharsetChoice {
    let best = |family_only: bool| {
        candidates
            .iter()
            .filter(|c| allow.allows(&c.encoding))
            .filter(|c| !family_only || c.is_preferred_family())
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    };

    let chosen = best(true)
        .filter(|c| c.confidence > FAMILY_THRESHOLD)
        .or_else(|| best(false).filter(|c| c.confidence > ANY_THRESHOLD));

    match chosen {
        Some(c) => CharsetChoice {
            encoding: c.encoding.clone(),
            confidence: c.confidence,
        },
        None => CharsetChoice {
            encoding: FALLBACK_ENCODING.to_string(),
            confidence: 0.0,
        },
    }
}

/// Decodes raw ZIP names with a detector and an allow-list.
pub struct FilenameDecoder {
    detector: Box<dyn CharsetDetector>,
    allow: AllowList,
}

impl FilenameDecoder {
    pub fn new(detector: Box<dyn CharsetDetector>, allow: AllowList) -> Self {
        Self { detector, allow }
    }

    /// Decode `raw`. Names flagged as UTF-8 by the archiver skip detection.
    pub fn decode(&self, raw: &[u8], utf8_flag: bool) -> (String, CharsetChoice) {
        let choice = if utf8_flag {
            CharsetChoice {
                encoding: UTF_8.name().to_string(),
                confidence: 1.0,
            }
        } else {
            select_charset(&self.detector.detect(raw), &self.allow)
        };

        // GB2312 is served by its GBK superset, as browsers do.
        let encoding = Encoding::for_label(choice.encoding.as_bytes()).unwrap_or(GBK);
        let (text, _, _) = encoding.decode(raw);
        (text.into_owned(), choice)
    }
}

impl Default for FilenameDecoder {
    fn default() -> Self {
        Self::new(Box::new(ChardetngDetector), AllowList::default())
    }
}
