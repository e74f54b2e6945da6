use crate::{out_of_resources, Error};
use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    ops::{Deref, DerefMut},
    ptr::NonNull,
    slice::{from_raw_parts, from_raw_parts_mut},
};

/// 主机页大小，使用主机指针的缓冲区要求按页对齐。
pub const PAGE: usize = 4096;

/// 页对齐、零初始化的主机内存，作为缓冲区的主机镜像。
pub struct HostBlob {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for HostBlob {}
unsafe impl Sync for HostBlob {}

impl HostBlob {
    pub fn new(size: usize) -> Result<Self, Error> {
        let layout = layout(size)?;
        match NonNull::new(unsafe { alloc_zeroed(layout) }) {
            Some(ptr) => Ok(Self { ptr, len: size }),
            None => Err(out_of_resources(format!("host mirror of {size} bytes"))),
        }
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for HostBlob {
    #[inline]
    fn drop(&mut self) {
        let &mut HostBlob { ptr, len } = self;
        if let Ok(layout) = layout(len) {
            unsafe { dealloc(ptr.as_ptr(), layout) }
        }
    }
}

#[inline]
fn layout(size: usize) -> Result<Layout, Error> {
    Layout::from_size_align(size.max(1), PAGE)
        .map_err(|_| out_of_resources(format!("host mirror of {size} bytes")))
}

impl Deref for HostBlob {
    type Target = [u8];
    #[inline]
    fn deref(&self) -> &[u8] {
        unsafe { from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for HostBlob {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

#[test]
fn test_blob() {
    let mut blob = HostBlob::new(5000).unwrap();
    assert_eq!(blob.len(), 5000);
    assert_eq!(blob.as_mut_ptr() as usize % PAGE, 0);
    assert!(blob.iter().all(|&b| b == 0));
    blob[4999] = 7;
    assert_eq!(blob[4999], 7);
    assert!(HostBlob::new(usize::MAX).is_err());
}
