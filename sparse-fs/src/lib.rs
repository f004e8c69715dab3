#![no_std]

extern crate alloc;

/* 整体架构，自上而下 */

// 文件系统根：持有缓存、空闲扇区分配器与打开 inode 表
mod fs;

// 索引节点层：打开、读写、删除文件
mod inode;

// 磁盘数据结构层：inode 记录与多级索引树
mod layout;

// 扇区缓存层：内存上的扇区数据缓存
mod cache;

// 空闲扇区分配器接口层
mod space;

// 错误
mod error;

pub use self::{
    cache::{ReadGuard, SectorCache, WriteGuard, CACHE_SLOTS},
    error::FsError,
    fs::{SparseFileSystem, ROOT_SECTOR},
    inode::Inode,
    layout::{IndirectBlock, InodeKind, InodeRecord, MAX_FILE_SIZE},
    space::FreeSpace,
};
pub use sector_dev::{SectorDevice, SectorId, SECTOR_SIZE};

pub const MAGIC: u32 = 0x73704653;
