//! Static knowledge about embedding model families.
//!
//! Nothing here touches a model file. These helpers answer "how many dimensions
//! does this model produce", "does it want a query/passage prefix" and "what does
//! the text look like once control characters are gone", and are shared by the
//! worker and by executors that need to report capabilities before the worker
//! has started.

use serde::{Deserialize, Serialize};

/// Model used when none is configured.
pub const DEFAULT_MODEL_ID: &str = "Xenova/multilingual-e5-small";

/// Model id of the built-in feature hashing pipeline.
pub const HASHING_MODEL_ID: &str = "hashing";

/// Token window of the transformer models we load.
pub const MAX_TOKENS: usize = 512;

const DEFAULT_DIMENSIONS: usize = 384;
const QUERY_PREFIX: &str = "query: ";
const PASSAGE_PREFIX: &str = "passage: ";

/// ONNX weight variant to load from a model repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantization {
    #[default]
    Q8,
    Q4,
    Fp16,
    Fp32,
}

impl Quantization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quantization::Q8 => "q8",
            Quantization::Q4 => "q4",
            Quantization::Fp16 => "fp16",
            Quantization::Fp32 => "fp32",
        }
    }

    /// ONNX files to try, in order, inside a Transformers.js style repository.
    pub fn onnx_candidates(&self) -> &'static [&'static str] {
        match self {
            Quantization::Q8 => &["onnx/model_quantized.onnx", "onnx/model.onnx"],
            Quantization::Q4 => &[
                "onnx/model_q4.onnx",
                "onnx/model_quantized.onnx",
                "onnx/model.onnx",
            ],
            Quantization::Fp16 => &["onnx/model_fp16.onnx", "onnx/model.onnx"],
            Quantization::Fp32 => &["onnx/model.onnx"],
        }
    }
}

impl std::fmt::Display for Quantization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Quantization {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "q8" | "int8" => Ok(Quantization::Q8),
            "q4" => Ok(Quantization::Q4),
            "fp16" => Ok(Quantization::Fp16),
            "fp32" => Ok(Quantization::Fp32),
            other => Err(format!(
                "unknown quantization `{other}` (expected one of q8, q4, fp16, fp32)"
            )),
        }
    }
}

/// Capabilities of a model family, derived from its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub model_id: String,
    pub dimensions: usize,
    pub max_tokens: usize,
    pub multilingual: bool,
    /// Whether query and passage texts need the E5 style prefixes
    pub asymmetric_prefixes: bool,
}

impl ModelSpec {
    pub fn for_model(model_id: &str) -> Self {
        let lower = model_id.to_lowercase();
        Self {
            model_id: model_id.to_string(),
            dimensions: dimensions_for(&lower),
            max_tokens: MAX_TOKENS,
            multilingual: lower.contains("multilingual"),
            asymmetric_prefixes: is_e5_model(&lower),
        }
    }

    pub fn query_text(&self, text: &str) -> String {
        if self.asymmetric_prefixes {
            format!("{QUERY_PREFIX}{text}")
        } else {
            text.to_string()
        }
    }

    pub fn passage_text(&self, text: &str) -> String {
        if self.asymmetric_prefixes {
            format!("{PASSAGE_PREFIX}{text}")
        } else {
            text.to_string()
        }
    }
}

fn dimensions_for(lower_id: &str) -> usize {
    if lower_id == HASHING_MODEL_ID {
        DEFAULT_DIMENSIONS
    } else if lower_id.contains("large") {
        1024
    } else if lower_id.contains("base") {
        768
    } else {
        // small models and anything we do not recognise
        DEFAULT_DIMENSIONS
    }
}

/// E5 models were trained with "query: " / "passage: " prefixes.
pub fn is_e5_model(model_id: &str) -> bool {
    model_id.to_lowercase().contains("e5")
}

/// Rough token estimate used by `embed_with_details`.
pub fn approximate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Strip characters that upset tokenizers.
///
/// Removes NUL, the replacement character, and control, format and private-use
/// code points. Every whitespace character becomes a plain space so line
/// structure does not leak into the embedding.
pub fn clean_text(text: &str) -> String {
    text.chars()
        .filter_map(|c| {
            if c.is_whitespace() {
                Some(' ')
            } else if c == '\0' || c == '\u{FFFD}' || c.is_control() || is_format(c) || is_private_use(c)
            {
                None
            } else {
                Some(c)
            }
        })
        .collect()
}

fn is_format(c: char) -> bool {
    matches!(c,
        '\u{00AD}'
        | '\u{0600}'..='\u{0605}'
        | '\u{061C}'
        | '\u{06DD}'
        | '\u{070F}'
        | '\u{08E2}'
        | '\u{180E}'
        | '\u{200B}'..='\u{200F}'
        | '\u{202A}'..='\u{202E}'
        | '\u{2060}'..='\u{2064}'
        | '\u{2066}'..='\u{206F}'
        | '\u{FEFF}'
        | '\u{FFF9}'..='\u{FFFB}'
        | '\u{110BD}'
        | '\u{110CD}'
        | '\u{1BCA0}'..='\u{1BCA3}'
        | '\u{1D173}'..='\u{1D17A}'
        | '\u{E0001}'
        | '\u{E0020}'..='\u{E007F}')
}

fn is_private_use(c: char) -> bool {
    matches!(c,
        '\u{E000}'..='\u{F8FF}'
        | '\u{F0000}'..='\u{FFFFD}'
        | '\u{100000}'..='\u{10FFFD}')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_dimensions() {
        assert_eq!(ModelSpec::for_model(DEFAULT_MODEL_ID).dimensions, 384);
        assert_eq!(
            ModelSpec::for_model("Xenova/multilingual-e5-base").dimensions,
            768
        );
        assert_eq!(
            ModelSpec::for_model("Xenova/multilingual-e5-large").dimensions,
            1024
        );
        assert_eq!(ModelSpec::for_model("someone/unknown").dimensions, 384);
        assert_eq!(ModelSpec::for_model(HASHING_MODEL_ID).dimensions, 384);
    }

    #[test]
    fn test_prefixes_only_for_e5() {
        let e5 = ModelSpec::for_model("intfloat/E5-small-v2");
        assert_eq!(e5.query_text("cats"), "query: cats");
        assert_eq!(e5.passage_text("cats"), "passage: cats");

        let plain = ModelSpec::for_model("Xenova/all-MiniLM-L6-v2");
        assert_eq!(plain.query_text("cats"), "cats");
        assert_eq!(plain.passage_text("cats"), "cats");
    }

    #[test]
    fn test_multilingual_flag() {
        assert!(ModelSpec::for_model(DEFAULT_MODEL_ID).multilingual);
        assert!(!ModelSpec::for_model(HASHING_MODEL_ID).multilingual);
    }

    #[test]
    fn test_clean_text() {
        assert_eq!(clean_text("a\0b\u{FFFD}c"), "abc");
        assert_eq!(clean_text("line one\nline\ttwo\r"), "line one line two ");
        assert_eq!(clean_text("zero\u{200B}width"), "zerowidth");
        assert_eq!(clean_text("private\u{E000}use"), "privateuse");
        assert_eq!(clean_text("bell\u{0007}"), "bell");
        assert_eq!(clean_text("héllo wörld"), "héllo wörld");
    }

    #[test]
    fn test_approximate_tokens() {
        assert_eq!(approximate_tokens(""), 0);
        assert_eq!(approximate_tokens("abcd"), 1);
        assert_eq!(approximate_tokens("abcde"), 2);
    }

    #[test]
    fn test_quantization_parsing() {
        assert_eq!("Q8".parse::<Quantization>(), Ok(Quantization::Q8));
        assert_eq!("fp32".parse::<Quantization>(), Ok(Quantization::Fp32));
        assert!("q3".parse::<Quantization>().is_err());
        assert_eq!(Quantization::Q8.onnx_candidates()[0], "onnx/model_quantized.onnx");
    }
}
