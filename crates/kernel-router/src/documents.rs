use std::path::PathBuf;

use async_trait::async_trait;
use log::info;
use serde_json::json;
use tokio::io::AsyncWriteExt;

use crate::backend::{DocumentError, DocumentProvider};

const MAX_UNTITLED: usize = 1000;

/// Creates empty `UntitledN.ipynb` notebooks in a directory.
#[derive(Debug, Clone)]
pub struct UntitledNotebooks {
    dir: PathBuf,
}

impl UntitledNotebooks {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl DocumentProvider for UntitledNotebooks {
    async fn new_untitled(&self) -> Result<String, DocumentError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| DocumentError::Create(e.to_string()))?;

        let contents = serde_json::to_vec_pretty(&json!({
            "cells": [],
            "metadata": {},
            "nbformat": 4,
            "nbformat_minor": 5
        }))
        .map_err(|e| DocumentError::Create(e.to_string()))?;

        for n in 0..MAX_UNTITLED {
            let name = if n == 0 {
                "Untitled.ipynb".to_string()
            } else {
                format!("Untitled{}.ipynb", n)
            };
            let path = self.dir.join(name);

            let mut file = match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(DocumentError::Create(e.to_string())),
            };
            file.write_all(&contents)
                .await
                .map_err(|e| DocumentError::Create(e.to_string()))?;

            info!("[documents] Created {}", path.display());
            return Ok(path.to_string_lossy().into_owned());
        }

        Err(DocumentError::Create(format!(
            "no free untitled name in {}",
            self.dir.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_creates_sequential_untitled_notebooks() {
        let dir = tempfile::tempdir().unwrap();
        let docs = UntitledNotebooks::new(dir.path());

        let first = docs.new_untitled().await.unwrap();
        let second = docs.new_untitled().await.unwrap();

        assert!(first.ends_with("Untitled.ipynb"));
        assert!(second.ends_with("Untitled1.ipynb"));

        let contents = std::fs::read_to_string(&first).unwrap();
        let notebook: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(notebook["nbformat"], 4);
    }

    #[tokio::test]
    async fn test_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let docs = UntitledNotebooks::new(dir.path().join("nested"));
        let path = docs.new_untitled().await.unwrap();
        assert!(std::path::Path::new(&path).exists());
    }
}
