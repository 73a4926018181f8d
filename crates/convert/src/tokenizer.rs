//! Tokenizer artifacts shipped with a bundle
//!
//! The tokenizer itself is never run here; `tokenizer.json` is only loaded
//! once to make sure a broken file is not copied into a bundle.

use std::path::{Path, PathBuf};

use crate::error::{ConvertError, Result};

/// Required tokenizer file
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Copied alongside `tokenizer.json` when present
pub const OPTIONAL_TOKENIZER_FILES: [&str; 2] = ["tokenizer_config.json", "special_tokens_map.json"];

/// Where tokenizer artifacts are taken from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenizerSource {
    /// A directory holding `tokenizer.json`
    Local(PathBuf),
    /// A hub repository, fetched with an optional access token
    Hub { repo: String, token: Option<String> },
}

/// Validated tokenizer files, keyed by the file name they are written as
#[derive(Debug, Clone, PartialEq)]
pub struct TokenizerArtifacts {
    files: Vec<(String, PathBuf)>,
    vocab_size: usize,
}

impl TokenizerArtifacts {
    pub fn load(source: &TokenizerSource) -> Result<Self> {
        match source {
            TokenizerSource::Local(dir) => Self::from_dir(dir),
            TokenizerSource::Hub { repo, token } => Self::from_hub(repo, token.clone()),
        }
    }

    /// Collect tokenizer files from a local directory
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let main = dir.join(TOKENIZER_FILE);
        if !main.is_file() {
            return Err(ConvertError::Tokenizer(format!(
                "{} not found in {}",
                TOKENIZER_FILE,
                dir.display()
            )));
        }
        let optional = OPTIONAL_TOKENIZER_FILES
            .iter()
            .map(|name| (name.to_string(), dir.join(name)))
            .filter(|(_, path)| path.is_file());
        Self::from_files(main, optional)
    }

    /// Download tokenizer files from a hub repository
    #[cfg(feature = "hub")]
    pub fn from_hub(repo: &str, token: Option<String>) -> Result<Self> {
        use hf_hub::api::sync::ApiBuilder;

        let api = ApiBuilder::new()
            .with_token(token)
            .build()
            .map_err(|e| ConvertError::Hub(e.to_string()))?;
        let model = api.model(repo.to_string());

        let main = model
            .get(TOKENIZER_FILE)
            .map_err(|e| ConvertError::Hub(format!("{}/{}: {}", repo, TOKENIZER_FILE, e)))?;
        let optional: Vec<(String, PathBuf)> = OPTIONAL_TOKENIZER_FILES
            .iter()
            .filter_map(|name| model.get(name).ok().map(|path| (name.to_string(), path)))
            .collect();

        tracing::info!(repo, files = optional.len() + 1, "Fetched tokenizer from hub");
        Self::from_files(main, optional)
    }

    #[cfg(not(feature = "hub"))]
    pub fn from_hub(repo: &str, _token: Option<String>) -> Result<Self> {
        Err(ConvertError::Hub(format!(
            "cannot fetch {}: built without the `hub` feature",
            repo
        )))
    }

    fn from_files(main: PathBuf, optional: impl IntoIterator<Item = (String, PathBuf)>) -> Result<Self> {
        let tokenizer = tokenizers::Tokenizer::from_file(&main)
            .map_err(|e| ConvertError::Tokenizer(format!("{}: {}", main.display(), e)))?;
        let vocab_size = tokenizer.get_vocab_size(true);

        let mut files = vec![(TOKENIZER_FILE.to_string(), main)];
        files.extend(optional);
        Ok(Self { files, vocab_size })
    }

    pub fn files(&self) -> &[(String, PathBuf)] {
        &self.files
    }

    /// Vocabulary size including added tokens
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Copy every artifact into `dir`
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        for (name, source) in &self.files {
            std::fs::copy(source, dir.join(name))?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Smallest word-level tokenizer the `tokenizers` crate accepts
    pub(crate) const TINY_TOKENIZER: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"<unk>": 0, "hello": 1, "world": 2},
            "unk_token": "<unk>"
        }
    }"#;

    #[test]
    fn test_from_dir_collects_present_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(TOKENIZER_FILE), TINY_TOKENIZER).unwrap();
        std::fs::write(dir.path().join("tokenizer_config.json"), "{}").unwrap();

        let artifacts = TokenizerArtifacts::from_dir(dir.path()).unwrap();
        let names: Vec<&str> = artifacts.files().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["tokenizer.json", "tokenizer_config.json"]);
        assert_eq!(artifacts.vocab_size(), 3);
    }

    #[test]
    fn test_missing_tokenizer_json() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            TokenizerArtifacts::from_dir(dir.path()),
            Err(ConvertError::Tokenizer(_))
        ));
    }

    #[test]
    fn test_corrupt_tokenizer_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(TOKENIZER_FILE), "{not json").unwrap();
        assert!(matches!(
            TokenizerArtifacts::from_dir(dir.path()),
            Err(ConvertError::Tokenizer(_))
        ));
    }
}
