//! Peer address persistence
//!
//! Writes the serialized address manager to disk atomically (temp file then
//! rename) and keeps a few rotated backups to fall back on when the main file
//! does not decode.

use crate::network::addrman::{AddrManConfig, AddrManError, AddrManager};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Address data error: {0}")]
    AddrMan(#[from] AddrManError),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub peers_file: String,
    pub backup_enabled: bool,
    pub max_backups: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".peerbloom"),
            peers_file: "peers.dat".to_string(),
            backup_enabled: true,
            max_backups: 3,
        }
    }
}

/// On-disk home of the address manager
pub struct PeerStore {
    config: StorageConfig,
}

impl PeerStore {
    /// Create the data directory if needed
    pub fn new(config: StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.data_dir)?;
        Ok(Self { config })
    }

    /// Store under `data_dir` with default file names
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Self::new(StorageConfig {
            data_dir: data_dir.into(),
            ..Default::default()
        })
    }

    pub fn peers_path(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.peers_file)
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}.backup.{}", self.config.peers_file, index))
    }

    pub fn exists(&self) -> bool {
        self.peers_path().exists()
    }

    /// Save a serialized address manager
    pub fn save(&self, data: &[u8]) -> Result<(), StorageError> {
        let path = self.peers_path();

        if self.config.backup_enabled && self.config.max_backups > 0 && path.exists() {
            self.rotate_backups()?;
            fs::copy(&path, self.backup_path(0))?;
        }

        // Write to temporary file first
        let temp_path = self.config.data_dir.join(format!("{}.tmp", self.config.peers_file));
        {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
        }

        // Atomic rename
        fs::rename(&temp_path, &path)?;
        log::debug!("Saved {} bytes of peer data to {}", data.len(), path.display());

        Ok(())
    }

    /// Load the address manager, falling back to backups when the main
    /// file is unreadable. `Ok(None)` when nothing was ever saved.
    pub fn load(&self, config: AddrManConfig) -> Result<Option<AddrManager>, StorageError> {
        let path = self.peers_path();
        if !path.exists() {
            return Ok(None);
        }

        let primary = fs::read(&path)
            .map_err(StorageError::from)
            .and_then(|data| AddrManager::deserialize(config, &data).map_err(StorageError::from));

        match primary {
            Ok(addrman) => Ok(Some(addrman)),
            Err(e) => {
                log::warn!("Peer file {} unusable: {}", path.display(), e);
                for index in self.list_backups() {
                    match self.restore_backup(index, config) {
                        Ok(addrman) => {
                            log::info!("Restored peers from backup {}", index);
                            return Ok(Some(addrman));
                        }
                        Err(e) => log::warn!("Backup {} unusable: {}", index, e),
                    }
                }
                Err(e)
            }
        }
    }

    /// Delete the saved peers
    pub fn delete(&self) -> Result<(), StorageError> {
        let path = self.peers_path();
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Rotate backup files
    fn rotate_backups(&self) -> Result<(), StorageError> {
        // Delete oldest backup
        let oldest = self.backup_path(self.config.max_backups - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }

        // Shift existing backups
        for i in (0..self.config.max_backups - 1).rev() {
            let current = self.backup_path(i);
            if current.exists() {
                fs::rename(&current, self.backup_path(i + 1))?;
            }
        }

        Ok(())
    }

    /// Load a specific backup
    pub fn restore_backup(
        &self,
        index: usize,
        config: AddrManConfig,
    ) -> Result<AddrManager, StorageError> {
        let path = self.backup_path(index);
        if !path.exists() {
            return Err(StorageError::InvalidData(format!("Backup {} not found", index)));
        }

        let data = fs::read(&path)?;
        Ok(AddrManager::deserialize(config, &data)?)
    }

    /// List available backups, newest first
    pub fn list_backups(&self) -> Vec<usize> {
        (0..self.config.max_backups)
            .filter(|i| self.backup_path(*i).exists())
            .collect()
    }
}
