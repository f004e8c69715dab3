//! # 磁盘数据结构层
//!
//! 磁盘上只有三种扇区：inode 记录扇区、索引扇区、数据扇区。
//! 记录扇区恰好一扇区大，锚定一棵多级索引树；
//! 索引扇区整块都是4字节的扇区指针；数据扇区存放文件字节。
//!
//! 未分配的指针槽一律填哨兵 [`SectorId::NONE`]，
//! 与指向0号扇区的合法指针区分开。

mod index;
mod record;

use core::mem;

use sector_dev::SECTOR_SIZE;

pub(crate) use self::index::{release_tree, resolve};
pub use self::record::{InodeKind, InodeRecord};

/// 指针项字节数
const ENTRY_SIZE: usize = mem::size_of::<u32>();
/// 每个索引扇区可容纳的指针数
const ENTRIES_PER_SECTOR: usize = SECTOR_SIZE / ENTRY_SIZE;

/// 索引扇区的类型化视图
pub type IndirectBlock = [u32; ENTRIES_PER_SECTOR];

/// 记录内直接指针数
const DIRECT_COUNT: usize = 16;
/// 记录内一级间接指针数
const INDIRECT1_COUNT: usize = 8;
/// 记录内二级间接指针数
const INDIRECT2_COUNT: usize = 4;

/// 直接档的扇区容量
const DIRECT_CAP: usize = DIRECT_COUNT;
/// 加上一级间接档的扇区容量
const INDIRECT1_CAP: usize = DIRECT_CAP + INDIRECT1_COUNT * ENTRIES_PER_SECTOR;
/// 加上二级间接档的扇区容量，即索引树的寻址上限
const INDIRECT2_CAP: usize =
    INDIRECT1_CAP + INDIRECT2_COUNT * ENTRIES_PER_SECTOR * ENTRIES_PER_SECTOR;

/// 单个文件的字节容量上限
pub const MAX_FILE_SIZE: usize = INDIRECT2_CAP * SECTOR_SIZE;

/// 记录内元数据（长度、魔数、类型）占用的字节数，
/// 指针区紧随其后
const META_SIZE: usize = 3 * mem::size_of::<u32>();
