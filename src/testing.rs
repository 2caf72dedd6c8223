//! Test doubles shared by the unit tests.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;

use rand_core::{Error, RngCore};

use crate::transport::{
    FileHandle, FileStat, FileSystem, FsError, Handshake, Socket, TlsSession, TransportError,
};

/// Socket with a scripted send window that records everything written to it.
pub(crate) struct MockSocket {
    pub(crate) window: usize,
    pub(crate) written: Vec<u8>,
    pub(crate) closes: usize,
    pub(crate) connects: Vec<(String, u16)>,
}

impl MockSocket {
    pub(crate) fn new(window: usize) -> Self {
        Self {
            window,
            written: Vec::new(),
            closes: 0,
            connects: Vec::new(),
        }
    }

    /// The peer acknowledged `n` bytes.
    pub(crate) fn ack(&mut self, n: usize) {
        self.window += n;
    }

    pub(crate) fn take_written(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.written)
    }
}

impl Socket for MockSocket {
    fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        self.connects.push((String::from(host), port));
        Ok(())
    }

    fn send_window(&self) -> usize {
        self.window
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let n = data.len().min(self.window);
        self.written.extend_from_slice(&data[..n]);
        self.window -= n;
        Ok(n)
    }

    fn close(&mut self) {
        self.closes += 1;
    }
}

/// A pretend TLS session. The client says `HELLO`, the server answers `WELCOME`, records carry a
/// one byte length header and payloads are XORed with a fixed key.
pub(crate) struct XorTls {
    key: u8,
    fingerprint: [u8; 20],
}

impl XorTls {
    pub(crate) fn new(key: u8) -> Self {
        Self {
            key,
            fingerprint: [key; 20],
        }
    }
}

impl TlsSession for XorTls {
    fn handshake(
        &mut self,
        _host: &str,
        input: &[u8],
        output: &mut Vec<u8>,
    ) -> Result<Handshake, TransportError> {
        match input {
            b"" => {
                output.extend_from_slice(b"HELLO");
                Ok(Handshake::InProgress)
            }
            b"WELCOME" => Ok(Handshake::Complete),
            _ => Err(TransportError::TlsHandshakeFailed),
        }
    }

    fn decrypt(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(), TransportError> {
        output.extend(input.iter().map(|b| b ^ self.key));
        Ok(())
    }

    fn encrypt(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(), TransportError> {
        output.push(input.len() as u8);
        output.extend(input.iter().map(|b| b ^ self.key));
        Ok(())
    }

    fn encrypted_len(&self, plain_len: usize) -> usize {
        plain_len + 1
    }

    fn peer_fingerprint(&self) -> Option<[u8; 20]> {
        Some(self.fingerprint)
    }
}

/// Deterministic xorshift generator.
pub(crate) struct TestRng(u64);

impl TestRng {
    pub(crate) fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }
}

impl RngCore for TestRng {
    fn next_u32(&mut self) -> u32 {
        self.next_u64() as u32
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

struct MemFile {
    data: Vec<u8>,
    modified: u32,
}

struct OpenFile {
    path: String,
    pos: usize,
}

/// In-memory filesystem.
#[derive(Default)]
pub(crate) struct MemFs {
    files: RefCell<BTreeMap<String, MemFile>>,
    open: RefCell<BTreeMap<u32, OpenFile>>,
    next_handle: RefCell<u32>,
}

impl MemFs {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, path: &str, data: &[u8], modified: u32) {
        self.files.borrow_mut().insert(
            String::from(path),
            MemFile {
                data: data.to_vec(),
                modified,
            },
        );
    }

    pub(crate) fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.files.borrow().get(path).map(|f| f.data.clone())
    }

    pub(crate) fn open_handles(&self) -> usize {
        self.open.borrow().len()
    }

    fn path_of(&self, file: FileHandle) -> Result<String, FsError> {
        self.open
            .borrow()
            .get(&file.0)
            .map(|f| f.path.clone())
            .ok_or(FsError::Io)
    }
}

impl FileSystem for MemFs {
    fn open(&self, path: &str, create: bool) -> Result<FileHandle, FsError> {
        if create {
            self.insert(path, b"", 0);
        } else if !self.files.borrow().contains_key(path) {
            return Err(FsError::NotFound);
        }

        let mut next = self.next_handle.borrow_mut();
        *next += 1;
        self.open.borrow_mut().insert(
            *next,
            OpenFile {
                path: String::from(path),
                pos: 0,
            },
        );
        Ok(FileHandle(*next))
    }

    fn read(&self, file: FileHandle, buf: &mut [u8]) -> Result<usize, FsError> {
        let path = self.path_of(file)?;
        let mut open = self.open.borrow_mut();
        let handle = open.get_mut(&file.0).ok_or(FsError::Io)?;
        let files = self.files.borrow();
        let data = &files.get(&path).ok_or(FsError::NotFound)?.data;

        let start = handle.pos.min(data.len());
        let n = (data.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&data[start..start + n]);
        handle.pos += n;
        Ok(n)
    }

    fn write(&self, file: FileHandle, data: &[u8]) -> Result<usize, FsError> {
        let path = self.path_of(file)?;
        let mut files = self.files.borrow_mut();
        let entry = files.get_mut(&path).ok_or(FsError::NotFound)?;
        entry.data.extend_from_slice(data);
        entry.modified += 1;
        Ok(data.len())
    }

    fn seek(&self, file: FileHandle, offset: usize) -> Result<(), FsError> {
        let mut open = self.open.borrow_mut();
        let handle = open.get_mut(&file.0).ok_or(FsError::Io)?;
        handle.pos = offset;
        Ok(())
    }

    fn stat(&self, file: FileHandle) -> Result<FileStat, FsError> {
        let path = self.path_of(file)?;
        let files = self.files.borrow();
        let entry = files.get(&path).ok_or(FsError::NotFound)?;
        Ok(FileStat {
            size: entry.data.len(),
            modified: entry.modified,
        })
    }

    fn close(&self, file: FileHandle) {
        self.open.borrow_mut().remove(&file.0);
    }
}
