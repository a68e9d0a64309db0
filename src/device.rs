//! Block device registry.
//!
//! A device descriptor is an ordered list of directory paths, usually loaded
//! from a colon-separated environment variable. A new stream file is placed
//! into the first path that accepts file creation.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use log;

use crate::error::{Error, Result};
use crate::tempname;

/// Environment variable consulted for the default device description.
pub const SINGLE_DEVICE_ENV: &str = "AMI_SINGLE_DEVICE";

/// Ordered list of directories a stream file may be placed on.
#[derive(Debug, Clone, Default)]
pub struct DeviceDescriptor {
    paths: Vec<PathBuf>,
}

impl DeviceDescriptor {
    /// Creates an empty descriptor.
    pub fn new() -> Self {
        DeviceDescriptor::default()
    }

    /// Parses a colon-separated list of directory paths.
    pub fn set_to_path(&mut self, list: &str) {
        self.paths = list.split(':').map(PathBuf::from).collect();
    }

    /// Loads the descriptor from the named environment variable.
    pub fn read_environment(&mut self, name: &str) -> Result<()> {
        match env::var(name) {
            Ok(value) => {
                self.set_to_path(&value);
                return Ok(());
            }
            Err(_) => return Err(Error::EnvUndefined(name.to_string())),
        }
    }

    /// Number of device paths.
    pub fn arity(&self) -> usize {
        self.paths.len()
    }

    /// The `index`-th device path.
    pub fn path(&self, index: usize) -> Option<&Path> {
        self.paths.get(index).map(PathBuf::as_path)
    }

    /// The first path accepting file creation.
    ///
    /// Each candidate is probed by creating and removing a scratch file;
    /// unwritable candidates are skipped with a warning.
    pub fn first_writable(&self) -> Result<&Path> {
        for path in &self.paths {
            let probe = tempname::tempnam("probe", Some(path), None);
            match fs::File::create(&probe) {
                Ok(_) => {
                    let _ = fs::remove_file(&probe);
                    return Ok(path);
                }
                Err(err) => {
                    log::warn!("device path {} not writable: {}", path.display(), err);
                }
            }
        }
        return Err(Error::NotFound(String::from("no writable device path")));
    }
}
