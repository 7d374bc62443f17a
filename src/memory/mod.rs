//! The paged virtual-memory substrate: a flat byte-addressable space with
//! per-page access rights and a fault-handler dispatch. Every application
//! read or write funnels through here; the consistency engine is just the
//! thing that answers faults.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{DsmError, Result};

pub type PageNr = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessRights {
    NoAccess,
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    Write,
}

/// Handles an access-rights fault. Implementations generally need a network
/// round trip (copy or diff request) before returning; the access that
/// triggered the fault does not proceed until this returns.
#[async_trait]
pub trait FaultListener: Send + Sync {
    async fn on_fault(
        &self,
        vm: &VirtualMemory,
        page: PageNr,
        kind: FaultKind,
        addr: usize,
        len: usize,
    ) -> Result<()>;
}

pub struct VirtualMemory {
    data: RwLock<Vec<u8>>,
    rights: RwLock<Vec<AccessRights>>,
    page_size: usize,
    listeners: RwLock<Vec<Arc<dyn FaultListener>>>,
    rights_disabled: AtomicBool,
}

impl VirtualMemory {
    pub fn new(size: usize, page_size: usize) -> Self {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");
        let num_pages = size.div_ceil(page_size);
        Self {
            data: RwLock::new(vec![0u8; size]),
            rights: RwLock::new(vec![AccessRights::NoAccess; num_pages]),
            page_size,
            listeners: RwLock::new(Vec::new()),
            rights_disabled: AtomicBool::new(false),
        }
    }

    pub fn size(&self) -> usize {
        self.data.read().len()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn num_pages(&self) -> usize {
        self.rights.read().len()
    }

    pub fn page_of(&self, addr: usize) -> PageNr {
        (addr / self.page_size) as PageNr
    }

    pub fn rights(&self, page: PageNr) -> AccessRights {
        self.rights.read()[page as usize]
    }

    pub fn set_rights(&self, page: PageNr, rights: AccessRights) {
        self.rights.write()[page as usize] = rights;
    }

    pub fn add_fault_listener(&self, listener: Arc<dyn FaultListener>) {
        self.listeners.write().push(listener);
    }

    /// Globally bypass rights checks. Used by tests and by the engine's own
    /// privileged paths that must not recursively re-fault.
    pub fn access_rights_disabled(&self, disabled: bool) {
        self.rights_disabled.store(disabled, Ordering::SeqCst);
    }

    pub async fn read(&self, addr: usize) -> Result<u8> {
        Ok(self.read_bytes(addr, 1).await?[0])
    }

    pub async fn write(&self, addr: usize, value: u8) -> Result<()> {
        self.write_bytes(addr, &[value]).await
    }

    pub async fn read_bytes(&self, addr: usize, len: usize) -> Result<Vec<u8>> {
        self.bounds_check(addr, len)?;
        self.ensure_access(addr, len, FaultKind::Read, None).await?;
        self.privileged_read(addr, len)
    }

    pub async fn write_bytes(&self, addr: usize, bytes: &[u8]) -> Result<()> {
        self.bounds_check(addr, bytes.len())?;
        self.ensure_access(addr, bytes.len(), FaultKind::Write, Some(bytes))
            .await?;
        self.privileged_write(addr, bytes)
    }

    /// Read bypassing rights checks entirely. Used by the engine to inspect
    /// or patch pages while servicing a fault.
    pub fn privileged_read(&self, addr: usize, len: usize) -> Result<Vec<u8>> {
        self.bounds_check(addr, len)?;
        Ok(self.data.read()[addr..addr + len].to_vec())
    }

    pub fn privileged_write(&self, addr: usize, bytes: &[u8]) -> Result<()> {
        self.bounds_check(addr, bytes.len())?;
        self.data.write()[addr..addr + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn bounds_check(&self, addr: usize, len: usize) -> Result<()> {
        let in_bounds = matches!(addr.checked_add(len), Some(end) if end <= self.size());
        if !in_bounds {
            return Err(DsmError::OutOfBounds {
                addr,
                size: self.size(),
            });
        }
        Ok(())
    }

    /// Walk every page the access touches, and for each page lacking the
    /// rights the access needs, invoke every registered fault listener in
    /// turn before continuing. Locks are never held across the listener
    /// await point.
    async fn ensure_access(
        &self,
        addr: usize,
        len: usize,
        kind: FaultKind,
        write_value: Option<&[u8]>,
    ) -> Result<()> {
        if self.rights_disabled.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut offset = 0usize;
        while offset < len {
            let page = self.page_of(addr + offset);
            let page_start = page as usize * self.page_size;
            let page_end = page_start + self.page_size;
            let span_end = (addr + len).min(page_end);
            let span_len = span_end - (addr + offset);

            if !self.rights_sufficient(page, kind) {
                let listeners: Vec<_> = self.listeners.read().clone();
                let value = write_value.map(|b| &b[offset..offset + span_len]);
                for listener in &listeners {
                    listener
                        .on_fault(self, page, kind, addr + offset, span_len)
                        .await?;
                    let _ = value;
                    if self.rights_sufficient(page, kind) {
                        break;
                    }
                }
            }

            offset += span_len;
        }
        Ok(())
    }

    fn rights_sufficient(&self, page: PageNr, kind: FaultKind) -> bool {
        match (self.rights(page), kind) {
            (AccessRights::NoAccess, _) => false,
            (AccessRights::ReadOnly, FaultKind::Read) => true,
            (AccessRights::ReadOnly, FaultKind::Write) => false,
            (AccessRights::ReadWrite, _) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct GrantAll;

    #[async_trait]
    impl FaultListener for GrantAll {
        async fn on_fault(
            &self,
            vm: &VirtualMemory,
            page: PageNr,
            kind: FaultKind,
            _addr: usize,
            _len: usize,
        ) -> Result<()> {
            let rights = match kind {
                FaultKind::Read => AccessRights::ReadOnly,
                FaultKind::Write => AccessRights::ReadWrite,
            };
            vm.set_rights(page, rights);
            Ok(())
        }
    }

    #[tokio::test]
    async fn privileged_access_bypasses_rights() {
        let vm = VirtualMemory::new(16, 8);
        vm.privileged_write(3, &[9]).unwrap();
        assert_eq!(vm.privileged_read(3, 1).unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn fault_listener_is_invoked_and_grants_access() {
        let vm = VirtualMemory::new(16, 8);
        vm.add_fault_listener(Arc::new(GrantAll));
        vm.write(2, 0x42).await.unwrap();
        assert_eq!(vm.rights(0), AccessRights::ReadWrite);
        assert_eq!(vm.read(2).await.unwrap(), 0x42);
    }

    #[tokio::test]
    async fn out_of_bounds_access_is_rejected() {
        let vm = VirtualMemory::new(16, 8);
        vm.add_fault_listener(Arc::new(GrantAll));
        assert!(vm.read(16).await.is_err());
    }

    #[tokio::test]
    async fn rights_disabled_skips_fault_dispatch() {
        let vm = VirtualMemory::new(16, 8);
        vm.access_rights_disabled(true);
        // No listener registered; if ensure_access dispatched it would hang
        // forever waiting on an empty listener list doing nothing useful,
        // but more importantly rights stay NoAccess and this must still work.
        vm.write(0, 7).await.unwrap();
        assert_eq!(vm.read(0).await.unwrap(), 7);
    }
}
