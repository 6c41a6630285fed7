/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Compression support for backups

use crate::error::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Base extension of every artifact file
pub const ARTIFACT_EXTENSION: &str = ".json";

/// Compression configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub default_type: CompressionType,
    pub level: CompressionLevel,
}

/// Supported compression types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    Gzip,
    Zstd,
    Lz4,
}

/// Compression level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    Fast,
    Balanced,
    Best,
    Custom(i32),
}

impl Default for CompressionConfig {
    fn default() -> Self {
        // Plain JSON keeps artifacts readable by existing tooling
        Self {
            default_type: CompressionType::None,
            level: CompressionLevel::Balanced,
        }
    }
}

impl CompressionType {
    const ALL: [CompressionType; 4] = [
        CompressionType::Gzip,
        CompressionType::Zstd,
        CompressionType::Lz4,
        CompressionType::None,
    ];

    pub fn extension(&self) -> &'static str {
        match self {
            CompressionType::None => "",
            CompressionType::Gzip => ".gz",
            CompressionType::Zstd => ".zst",
            CompressionType::Lz4 => ".lz4",
        }
    }

    /// File name of an artifact stored with this compression
    pub fn file_name(&self, backup_id: &str) -> String {
        format!("{}{}{}", backup_id, ARTIFACT_EXTENSION, self.extension())
    }

    /// Split an artifact file name into backup id and compression.
    /// Returns `None` for files that are not artifacts.
    pub fn parse_file_name(file_name: &str) -> Option<(&str, CompressionType)> {
        CompressionType::ALL.iter().find_map(|compression| {
            let suffix = format!("{}{}", ARTIFACT_EXTENSION, compression.extension());
            file_name
                .strip_suffix(suffix.as_str())
                .filter(|id| !id.is_empty())
                .map(|id| (id, *compression))
        })
    }

    pub fn compress(&self, data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
        let level = level.to_level(*self);
        match self {
            CompressionType::None => Ok(data.to_vec()),
            CompressionType::Gzip => {
                let level = flate2::Compression::new(level.clamp(0, 9) as u32);
                let mut encoder = flate2::write::GzEncoder::new(Vec::new(), level);
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
            CompressionType::Zstd => zstd::encode_all(data, level).map_err(BackupError::from),
            CompressionType::Lz4 => {
                let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
                encoder.write_all(data)?;
                encoder
                    .finish()
                    .map_err(|e| BackupError::CompressionError(e.to_string()))
            }
        }
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        match self {
            CompressionType::None => output.extend_from_slice(data),
            CompressionType::Gzip => {
                flate2::read::GzDecoder::new(data)
                    .read_to_end(&mut output)
                    .map_err(|e| BackupError::CompressionError(format!("gzip: {}", e)))?;
            }
            CompressionType::Zstd => {
                output = zstd::decode_all(data)
                    .map_err(|e| BackupError::CompressionError(format!("zstd: {}", e)))?;
            }
            CompressionType::Lz4 => {
                lz4_flex::frame::FrameDecoder::new(data)
                    .read_to_end(&mut output)
                    .map_err(|e| BackupError::CompressionError(format!("lz4: {}", e)))?;
            }
        }
        Ok(output)
    }
}

impl std::str::FromStr for CompressionType {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(CompressionType::None),
            "gzip" | "gz" => Ok(CompressionType::Gzip),
            "zstd" | "zst" => Ok(CompressionType::Zstd),
            "lz4" => Ok(CompressionType::Lz4),
            other => Err(BackupError::ConfigError(format!(
                "Unknown compression type: {}",
                other
            ))),
        }
    }
}

impl CompressionLevel {
    pub fn to_level(&self, compression_type: CompressionType) -> i32 {
        match (self, compression_type) {
            (CompressionLevel::Fast, CompressionType::Gzip) => 1,
            (CompressionLevel::Balanced, CompressionType::Gzip) => 6,
            (CompressionLevel::Best, CompressionType::Gzip) => 9,
            (CompressionLevel::Fast, CompressionType::Zstd) => 1,
            (CompressionLevel::Balanced, CompressionType::Zstd) => 3,
            (CompressionLevel::Best, CompressionType::Zstd) => 19,
            // lz4 frames have no level knob
            (_, CompressionType::Lz4) => 0,
            (CompressionLevel::Custom(level), _) => *level,
            (_, CompressionType::None) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_names() {
        assert_eq!(CompressionType::None.file_name("daily_x"), "daily_x.json");
        assert_eq!(CompressionType::Zstd.file_name("daily_x"), "daily_x.json.zst");

        assert_eq!(
            CompressionType::parse_file_name("daily_x.json.gz"),
            Some(("daily_x", CompressionType::Gzip))
        );
        assert_eq!(
            CompressionType::parse_file_name("daily_x.json"),
            Some(("daily_x", CompressionType::None))
        );
        assert_eq!(CompressionType::parse_file_name("index.tmp"), None);
        assert_eq!(CompressionType::parse_file_name(".json"), None);
    }

    #[test]
    fn test_every_codec_restores_input() {
        let data = br#"{"metadata":{"backupId":"manual_x"},"documentStore":{},"treeStore":null}"#
            .repeat(50);

        for compression in CompressionType::ALL {
            let packed = compression.compress(&data, CompressionLevel::Balanced).unwrap();
            if compression != CompressionType::None {
                assert!(packed.len() < data.len(), "{:?} did not shrink input", compression);
            }
            assert_eq!(compression.decompress(&packed).unwrap(), data);
        }
    }

    #[test]
    fn test_corrupt_input_is_reported() {
        let err = CompressionType::Gzip.decompress(b"not gzip").unwrap_err();
        assert!(matches!(err, BackupError::CompressionError(_)));
    }

    #[test]
    fn test_parse_compression_type() {
        assert_eq!("ZSTD".parse::<CompressionType>().unwrap(), CompressionType::Zstd);
        assert!("brotli".parse::<CompressionType>().is_err());
    }
}
