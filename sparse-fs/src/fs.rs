//! # 文件系统根
//!
//! [`SparseFileSystem`] 是整个存储核心的装配点：
//! 缓存、空闲扇区分配器和打开 inode 表都挂在这里，
//! 构造一次之后以共享引用传递，不设全局单例。

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use spin::Mutex;

use sector_dev::{SectorDevice, SectorId};

use crate::cache::SectorCache;
use crate::inode::{self, Inode};
use crate::layout::{InodeKind, InodeRecord};
use crate::space::FreeSpace;

/// 众所周知的根目录记录扇区
pub const ROOT_SECTOR: SectorId = SectorId::new(1);

/// 各层共享的运行期上下文
pub(crate) struct FsContext {
    pub(crate) cache: Arc<SectorCache>,
    pub(crate) space: Arc<dyn FreeSpace>,
    /// 打开 inode 表，按记录扇区号去重
    pub(crate) table: Mutex<BTreeMap<SectorId, Arc<Inode>>>,
}

pub struct SparseFileSystem {
    ctx: Arc<FsContext>,
}

impl SparseFileSystem {
    /// 在空白设备上建立文件系统：写出根目录的记录。
    /// 分配器实现需预留 [`ROOT_SECTOR`] 之前（含）的扇区。
    pub fn format(dev: Arc<dyn SectorDevice>, space: Arc<dyn FreeSpace>) -> Self {
        let fs = Self::assemble(dev, space);
        fs.create_inode(ROOT_SECTOR, 0, InodeKind::Directory);
        fs.flush();
        fs
    }

    /// 打开既有的文件系统，校验根记录
    pub fn open(dev: Arc<dyn SectorDevice>, space: Arc<dyn FreeSpace>) -> Self {
        let fs = Self::assemble(dev, space);
        let valid = fs
            .ctx
            .cache
            .read(ROOT_SECTOR)
            .map(0, |record: &InodeRecord| record.is_valid());
        assert!(valid, "root inode record magic mismatch");
        fs
    }

    fn assemble(dev: Arc<dyn SectorDevice>, space: Arc<dyn FreeSpace>) -> Self {
        Self {
            ctx: Arc::new(FsContext {
                cache: Arc::new(SectorCache::new(dev)),
                space,
                table: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// 向 `sector` 写出一份全新的 inode 记录。
    /// 记录扇区由调用者自空闲空间取得。
    pub fn create_inode(&self, sector: SectorId, length: u32, kind: InodeKind) {
        self.ctx
            .cache
            .write(sector)
            .map_mut(0, |record: &mut InodeRecord| record.init(length, kind));
    }

    /// 打开 `sector` 上的 inode；与 [`Inode::close`] 成对使用
    pub fn open_inode(&self, sector: SectorId) -> Arc<Inode> {
        inode::open(&self.ctx, sector)
    }

    #[inline]
    pub fn root(&self) -> Arc<Inode> {
        self.open_inode(ROOT_SECTOR)
    }

    /// 把缓存里的脏扇区写回设备
    #[inline]
    pub fn flush(&self) {
        self.ctx.cache.flush_all();
    }

    /// 供后台冲刷任务等外围设施使用
    #[inline]
    pub fn cache(&self) -> &Arc<SectorCache> {
        &self.ctx.cache
    }
}
