// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `target = "file"`: appends one JSON object per point to `path`.

use async_trait::async_trait;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::point::{Category, Point};
use crate::sink::{JsonPoint, Sink, SinkDescriptor, SinkError};

pub const TARGET: &str = "file";

#[derive(Debug)]
pub struct FileSink {
    id: String,
    path: PathBuf,
    categories: Vec<Category>,
    // Serializes appends so lines from concurrent batches never interleave.
    lock: Mutex<()>,
}

impl FileSink {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, categories: Vec<Category>) -> Self {
        let path = path.into();
        FileSink {
            id: format!("{TARGET}:{}", path.display()),
            path,
            categories,
            lock: Mutex::new(()),
        }
    }

    pub fn create(descriptor: &SinkDescriptor) -> Result<Arc<dyn Sink>, SinkError> {
        let path = descriptor
            .get_str("path")
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| SinkError::InvalidDescriptor("file sink requires 'path'".to_string()))?;
        Ok(Arc::new(FileSink::new(path.trim(), descriptor.categories())))
    }

    fn render(points: &[Point]) -> Result<Vec<u8>, SinkError> {
        let mut out = Vec::with_capacity(points.iter().map(Point::size_hint).sum());
        for point in points {
            serde_json::to_writer(&mut out, &JsonPoint::from(point))?;
            out.push(b'\n');
        }
        Ok(out)
    }
}

#[async_trait]
impl Sink for FileSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn categories(&self) -> &[Category] {
        &self.categories
    }

    async fn write(&self, _category: Category, points: &[Point]) -> Result<(), SinkError> {
        let data = Self::render(points)?;
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SinkError> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(&data)?;
            Ok(())
        })
        .await
        .map_err(|e| SinkError::Io(std::io::Error::other(e.to_string())))?
    }
}
