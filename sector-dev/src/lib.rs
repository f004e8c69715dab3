//! # 扇区设备接口层
//!
//! 扇区设备是以固定大小的**扇区**为单位寻址的存储设备。
//! [`SectorDevice`] 就是对同步读写扇区的抽象，
//! 实现了此特质的类型称为**扇区设备驱动**。
//!
//! 缓存层是扇区设备的唯一调用者，其余层都经由缓存访问设备。

#![no_std]

use derive_more::{From, Into};

/// 扇区字节数
pub const SECTOR_SIZE: usize = 512;

/// 扇区设备驱动特质
pub trait SectorDevice: Send + Sync {
    fn read_sector(&self, sector: SectorId, buf: &mut [u8]);
    fn write_sector(&self, sector: SectorId, buf: &[u8]);
}

/// 扇区编号
///
/// 磁盘上的指针项固定为4字节，因此内部用 `u32` 严控宽度。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into)]
#[repr(transparent)]
pub struct SectorId(u32);

impl From<SectorId> for usize {
    fn from(id: SectorId) -> Self {
        id.0 as usize
    }
}

impl SectorId {
    /// 空指针哨兵，不是合法的扇区编号；
    /// 与0区分开，0号扇区是真实存在的。
    pub const NONE: Self = Self(u32::MAX);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u32::MAX
    }
}
