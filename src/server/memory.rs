//! Byte arenas backing the virtual PLC.

use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{Error, Result};
use crate::s7_protocol::types::Area;

/// Size of every arena in bytes
pub const ARENA_SIZE: usize = 65_536;

/// Memory arenas modelled by the virtual PLC, in snapshot order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArenaId {
    /// Inputs (`I`)
    Input,
    /// Outputs (`Q`)
    Output,
    /// Merkers (`M`)
    Memory,
    /// Data block 1, also addressed as `V`
    Db1,
    /// Data block 2
    Db2,
    /// Data block 3
    Db3,
    /// Shared by every other data block number
    DbOther,
    /// Counters (`C`)
    Counter,
    /// Timers (`T`)
    Timer,
}

impl ArenaId {
    /// Every arena in snapshot order
    pub const ALL: [Self; 9] = [
        Self::Input,
        Self::Output,
        Self::Memory,
        Self::Db1,
        Self::Db2,
        Self::Db3,
        Self::DbOther,
        Self::Counter,
        Self::Timer,
    ];

    /// Arena serving `area`, data blocks other than 1, 2 and 3 share one arena
    /// # Errors
    ///
    /// Will return `Error::UnsupportedArea` for areas the virtual PLC does not model.
    pub fn resolve(area: Area, db_number: u16) -> Result<Self> {
        match area {
            Area::Input => Ok(Self::Input),
            Area::Output => Ok(Self::Output),
            Area::Memory => Ok(Self::Memory),
            Area::DataBlock => Ok(match db_number {
                1 => Self::Db1,
                2 => Self::Db2,
                3 => Self::Db3,
                _ => Self::DbOther,
            }),
            Area::Counter => Ok(Self::Counter),
            Area::Timer => Ok(Self::Timer),
            Area::AnalogIn | Area::AnalogOut => Err(Error::UnsupportedArea {
                area: area.code(),
                db_number,
            }),
        }
    }

    /// Resolve a raw area code as found in a request item
    pub(crate) fn resolve_code(code: u8, db_number: u16) -> Result<Self> {
        Area::from_code(code)
            .ok_or(Error::UnsupportedArea {
                area: code,
                db_number,
            })
            .and_then(|area| Self::resolve(area, db_number))
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Fixed size byte arenas, each behind its own lock
#[derive(Debug)]
pub struct VirtualMemoryStore {
    arenas: Vec<RwLock<Vec<u8>>>,
}

impl Default for VirtualMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualMemoryStore {
    /// Size of a complete snapshot
    pub const SNAPSHOT_SIZE: usize = ARENA_SIZE * ArenaId::ALL.len();

    /// Zero initialised arenas
    pub fn new() -> Self {
        Self {
            arenas: ArenaId::ALL
                .iter()
                .map(|_| RwLock::new(vec![0; ARENA_SIZE]))
                .collect(),
        }
    }

    /// Copy `length` bytes starting at `offset`
    /// # Errors
    ///
    /// Will return `Error::InvalidLength` if the range leaves the arena.
    pub fn read(&self, arena: ArenaId, offset: usize, length: usize) -> Result<Vec<u8>> {
        let bytes = self.arenas[arena.index()].read();
        offset
            .checked_add(length)
            .and_then(|end| bytes.get(offset..end))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                Error::InvalidLength(format!(
                    "{length} bytes at {offset} exceed the {ARENA_SIZE} byte arena {arena:?}"
                ))
            })
    }

    /// Store `data` at `offset`, clamped to the end of the arena.
    ///
    /// Returns the number of bytes written.
    pub fn write(&self, arena: ArenaId, offset: usize, data: &[u8]) -> usize {
        let mut bytes = self.arenas[arena.index()].write();
        if offset >= bytes.len() {
            return 0;
        }
        let count = data.len().min(bytes.len() - offset);
        bytes[offset..offset + count].copy_from_slice(&data[..count]);
        count
    }

    /// Value of the bit at bit address `bit_address` (`byte * 8 + bit`)
    /// # Errors
    ///
    /// Will return `Error::InvalidLength` if the address leaves the arena.
    pub fn get_bit(&self, arena: ArenaId, bit_address: usize) -> Result<bool> {
        let byte = self.read(arena, bit_address / 8, 1)?[0];
        Ok(byte & (1 << (bit_address % 8)) != 0)
    }

    /// Set or clear the bit at `bit_address`, all other bits stay untouched
    /// # Errors
    ///
    /// Will return `Error::InvalidLength` if the address leaves the arena.
    pub fn set_bit(&self, arena: ArenaId, bit_address: usize, value: bool) -> Result<()> {
        let mut bytes = self.arenas[arena.index()].write();
        let byte = bytes.get_mut(bit_address / 8).ok_or_else(|| {
            Error::InvalidLength(format!("bit {bit_address} exceeds the arena {arena:?}"))
        })?;
        let mask = 1 << (bit_address % 8);
        if value {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
        Ok(())
    }

    /// Concatenation of all arenas in [`ArenaId::ALL`] order
    pub fn snapshot(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(Self::SNAPSHOT_SIZE);
        for arena in &self.arenas {
            blob.extend_from_slice(&arena.read());
        }
        blob
    }

    /// Replace the content of all arenas with a snapshot
    /// # Errors
    ///
    /// Will return `Error::Snapshot` if the blob does not have the size of a
    /// complete snapshot, no arena is touched in that case.
    pub fn restore(&self, blob: &[u8]) -> Result<()> {
        if blob.len() != Self::SNAPSHOT_SIZE {
            return Err(Error::Snapshot {
                expected: Self::SNAPSHOT_SIZE,
                actual: blob.len(),
            });
        }
        for (arena, chunk) in self.arenas.iter().zip(blob.chunks_exact(ARENA_SIZE)) {
            arena.write().copy_from_slice(chunk);
        }
        Ok(())
    }

    /// Write a snapshot to `path`
    /// # Errors
    ///
    /// Will return `Error::Transport` if the file could not be written.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let blob = self.snapshot();
        tokio::fs::write(path.as_ref(), blob).await?;
        info!(path = %path.as_ref().display(), "saved memory snapshot");
        Ok(())
    }

    /// Restore a snapshot from `path`
    /// # Errors
    ///
    /// Will return `Error::Transport` if the file could not be read and
    /// `Error::Snapshot` if it is not a complete snapshot.
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let blob = tokio::fs::read(path.as_ref()).await?;
        self.restore(&blob)?;
        info!(path = %path.as_ref().display(), "loaded memory snapshot");
        Ok(())
    }
}
