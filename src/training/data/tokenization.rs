//! Tokenizer contract shared by teacher and student
//!
//! Distillation only makes sense when both models see the same token ids for
//! the same text, so the two tokenizers are compared once before training.

use std::path::Path;

use tracing::{debug, info};

use crate::error::{Error, Result};

/// Maps raw text to token ids
pub trait TextEncoder: Send + Sync {
    /// Identifier used in error messages (usually the tokenizer file path)
    fn identifier(&self) -> &str;

    /// Encode one text, including any special tokens the tokenizer adds
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
}

/// [`TextEncoder`] backed by a HuggingFace `tokenizer.json`
pub struct HfTokenizer {
    id: String,
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    /// Load a tokenizer from a `tokenizer.json` file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| Error::tokenizer(format!("{}: {e}", path.display())))?;
        Ok(Self {
            id: path.display().to_string(),
            inner,
        })
    }

    /// Vocabulary size including added tokens
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl TextEncoder for HfTokenizer {
    fn identifier(&self) -> &str {
        &self.id
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| Error::tokenizer(format!("{}: {e}", self.id)))?;
        Ok(encoding.get_ids().to_vec())
    }
}

/// Fail unless both tokenizers produce identical ids on every probe text
pub fn ensure_equivalent(
    teacher: &dyn TextEncoder,
    student: &dyn TextEncoder,
    probes: &[String],
) -> Result<()> {
    if probes.is_empty() {
        return Err(Error::config(format!(
            "cannot compare tokenizers '{}' and '{}' without probe texts",
            teacher.identifier(),
            student.identifier()
        )));
    }

    for (i, text) in probes.iter().enumerate() {
        let teacher_ids = teacher.encode(text)?;
        let student_ids = student.encode(text)?;
        if teacher_ids != student_ids {
            debug!(probe = i, ?teacher_ids, ?student_ids, "tokenizer outputs diverge");
            return Err(Error::config(format!(
                "tokenizer mismatch between teacher '{}' and student '{}' on probe {i}",
                teacher.identifier(),
                student.identifier()
            )));
        }
    }

    info!(
        teacher = teacher.identifier(),
        student = student.identifier(),
        probes = probes.len(),
        "Teacher and student tokenizers are output-identical"
    );
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Whitespace tokenizer hashing words into a small vocabulary
    pub(crate) struct WordEncoder {
        pub id: String,
        pub vocab: u32,
    }

    impl TextEncoder for WordEncoder {
        fn identifier(&self) -> &str {
            &self.id
        }

        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text
                .split_whitespace()
                .map(|w| 1 + w.bytes().map(u32::from).sum::<u32>() % (self.vocab - 1))
                .collect())
        }
    }

    fn probes() -> Vec<String> {
        vec!["a fine film".into(), "dull and slow".into()]
    }

    #[test]
    fn test_identical_tokenizers_pass() {
        let a = WordEncoder { id: "teacher-tok".into(), vocab: 50 };
        let b = WordEncoder { id: "student-tok".into(), vocab: 50 };
        assert!(ensure_equivalent(&a, &b, &probes()).is_ok());
    }

    #[test]
    fn test_mismatch_names_both_tokenizers() {
        let a = WordEncoder { id: "teacher-tok".into(), vocab: 50 };
        let b = WordEncoder { id: "student-tok".into(), vocab: 7 };
        let err = ensure_equivalent(&a, &b, &probes()).unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(msg.contains("teacher-tok"));
        assert!(msg.contains("student-tok"));
    }

    #[test]
    fn test_empty_probe_set_is_rejected() {
        let a = WordEncoder { id: "t".into(), vocab: 50 };
        assert!(ensure_equivalent(&a, &a, &[]).is_err());
    }
}
