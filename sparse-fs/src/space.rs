//! # 空闲扇区分配器接口层
//!
//! 磁盘空闲空间的管理不在本 crate 的职责内，
//! 核心层只把它当作一项服务来消费："给我一个扇区"/"收回这个扇区"。
//! 实现者自行保证内部同步。

use sector_dev::SectorId;

use crate::FsError;

pub trait FreeSpace: Send + Sync {
    /// 分配 `count` 个连续扇区，返回首个扇区的编号。
    /// 空间耗尽时返回 [`FsError::OutOfSpace`]。
    fn allocate(&self, count: usize) -> Result<SectorId, FsError>;

    /// 归还自 `start` 起的 `count` 个连续扇区
    fn release(&self, start: SectorId, count: usize);
}
