//! Plug-in service discovery from compile-time-emitted mapping files.
//!
//! A plug-in ships binary mapping records under `autoservices/<file>.bin`
//! in its resource tree. Each record names a service type, an implementing
//! type, the registration name and two flags (singleton, mark-as-default).
//! Because there is no runtime reflection, the owning plug-in supplies a
//! [`ServiceInstaller`] that knows how to turn a decoded mapping into an
//! actual typed registration.

use super::error::RegistryError;
use super::{OwnerId, ServiceRegistry};
use std::fs;
use std::io::Read;
use std::path::Path;

const MAPPING_VERSION: u8 = 0x01;

/// One decoded auto-service mapping record.
///
/// Record wire format, repeated until EOF:
/// `[u8 version][utf8 serviceType][utf8 implType][utf8 name][bool singleton][bool markAsDefault]`
/// where `utf8` is a big-endian u16 length followed by that many bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AutoServiceMapping {
    pub service_type: String,
    pub implementation_type: String,
    pub name: String,
    pub singleton: bool,
    pub mark_as_default: bool,
}

impl AutoServiceMapping {
    /// Reads the next mapping record, or `None` on clean EOF.
    pub fn read_next(input: &mut impl Read) -> Result<Option<Self>, RegistryError> {
        let mut version = [0u8; 1];
        match input.read(&mut version)? {
            0 => return Ok(None),
            _ => {}
        }
        if version[0] != MAPPING_VERSION {
            return Err(RegistryError::MalformedMapping(format!(
                "unknown mapping version {:#04x}",
                version[0]
            )));
        }

        let service_type = read_utf(input)?;
        let implementation_type = read_utf(input)?;
        let name = read_utf(input)?;
        let singleton = read_bool(input)?;
        let mark_as_default = read_bool(input)?;
        Ok(Some(Self {
            service_type,
            implementation_type,
            name,
            singleton,
            mark_as_default,
        }))
    }

    /// Serializes this mapping in the record wire format.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(MAPPING_VERSION);
        write_utf(out, &self.service_type);
        write_utf(out, &self.implementation_type);
        write_utf(out, &self.name);
        out.push(self.singleton as u8);
        out.push(self.mark_as_default as u8);
    }
}

fn read_utf(input: &mut impl Read) -> Result<String, RegistryError> {
    let mut len = [0u8; 2];
    input.read_exact(&mut len)?;
    let len = u16::from_be_bytes(len) as usize;
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| RegistryError::MalformedMapping(e.to_string()))
}

fn write_utf(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
}

fn read_bool(input: &mut impl Read) -> Result<bool, RegistryError> {
    let mut b = [0u8; 1];
    input.read_exact(&mut b)?;
    Ok(b[0] != 0)
}

/// Installs decoded mappings as typed registrations.
///
/// Implemented by the plug-in that owns the mapping files; `install` is
/// expected to call the typed [`ServiceRegistry`] registration methods for
/// the `(service_type, implementation_type)` pairs it ships.
pub trait ServiceInstaller: Send + Sync {
    fn install(
        &self,
        registry: &ServiceRegistry,
        owner: &OwnerId,
        mapping: &AutoServiceMapping,
    ) -> Result<(), RegistryError>;
}

/// Loads all mapping records from `<resource_root>/autoservices` and
/// registers them through the owner's installer.
///
/// Returns the number of installed mappings. A missing `autoservices`
/// directory simply installs nothing.
pub fn discover_from(
    registry: &ServiceRegistry,
    owner: &OwnerId,
    resource_root: &Path,
    installer: &dyn ServiceInstaller,
) -> Result<usize, RegistryError> {
    let dir = resource_root.join("autoservices");
    if !dir.is_dir() {
        return Ok(0);
    }

    let mut installed = 0;
    let mut entries: Vec<_> = fs::read_dir(&dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        if !entry.file_type()?.is_file() {
            continue;
        }
        let mut file = fs::File::open(entry.path())?;
        while let Some(mapping) = AutoServiceMapping::read_next(&mut file)? {
            installer.install(registry, owner, &mapping)?;
            installed += 1;
        }
    }
    Ok(installed)
}
