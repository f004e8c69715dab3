//! # 索引节点层
//!
//! [`Inode`] 是文件在内存中的把手，按记录扇区号去重：
//! 同一扇区的再次打开返回同一把手并加一次打开计数。
//! `remove` 只做标记，物理回收推迟到最后一次 `close`，
//! 已删除但仍被打开的文件照常可读可写。

use alloc::sync::Arc;
use core::cmp;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use sector_dev::{SectorId, SECTOR_SIZE};

use crate::fs::FsContext;
use crate::layout::{self, InodeRecord, MAX_FILE_SIZE};
use crate::FsError;

pub struct Inode {
    /// 记录扇区号，兼作 inode 的身份
    sector: SectorId,
    /// 打开计数；只在持有打开表锁时修改
    open_count: AtomicU32,
    /// 非零时写入一律被拒
    deny_writes: AtomicU32,
    /// 置位后物理回收推迟到最后一次 close
    removed: AtomicBool,
    /// 扩展锁，裁决并发的长度增长
    grow: Mutex<()>,
    ctx: Arc<FsContext>,
}

/// 打开 `sector` 上的 inode，已打开则复用既有把手
pub(crate) fn open(ctx: &Arc<FsContext>, sector: SectorId) -> Arc<Inode> {
    let mut table = ctx.table.lock();
    if let Some(inode) = table.get(&sector) {
        inode.open_count.fetch_add(1, Ordering::AcqRel);
        return inode.clone();
    }

    let inode = Arc::new(Inode {
        sector,
        open_count: AtomicU32::new(1),
        deny_writes: AtomicU32::new(0),
        removed: AtomicBool::new(false),
        grow: Mutex::new(()),
        ctx: ctx.clone(),
    });
    table.insert(sector, inode.clone());
    inode
}

impl Inode {
    /// inode 的编号，即其记录扇区号
    #[inline]
    pub fn sector(&self) -> SectorId {
        self.sector
    }

    pub fn length(&self) -> usize {
        self.ctx
            .cache
            .read(self.sector)
            .map(0, |record: &InodeRecord| record.length as usize)
    }

    pub fn is_dir(&self) -> bool {
        self.ctx
            .cache
            .read(self.sector)
            .map(0, |record: &InodeRecord| record.is_dir())
    }

    pub fn set_dir(&self, dir: bool) {
        self.ctx
            .cache
            .write(self.sector)
            .map_mut(0, |record: &mut InodeRecord| record.set_dir(dir));
    }

    /// 从 `offset` 起读出数据填充 `buf`，到文件末尾为止。
    /// 未分配的空洞按零读出。
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let end = cmp::min(offset.saturating_add(buf.len()), self.length());
        if offset >= end {
            return 0;
        }

        let mut pos = offset;
        let mut read = 0;
        while pos < end {
            let chunk_end = cmp::min((pos / SECTOR_SIZE + 1) * SECTOR_SIZE, end);
            let chunk = chunk_end - pos;
            let dest = &mut buf[read..read + chunk];

            match layout::resolve(&self.ctx.cache, &*self.ctx.space, self.sector, pos, false) {
                Ok(Some(sector)) => {
                    let guard = self.ctx.cache.read(sector);
                    let start = pos % SECTOR_SIZE;
                    dest.copy_from_slice(&guard.as_bytes()[start..start + chunk]);
                }
                Ok(None) | Err(_) => dest.fill(0),
            }

            read += chunk;
            pos = chunk_end;
        }

        read
    }

    /// 把 `buf` 写入 `offset` 起的位置，按需分配数据扇区并增长文件。
    ///
    /// 空闲空间中途耗尽时报告此前已写入的字节数；
    /// 一个字节都没写进去才返回错误。写入被拒时返回 0。
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, FsError> {
        if self.deny_writes.load(Ordering::Acquire) > 0 {
            return Ok(0);
        }
        let end = match offset.checked_add(buf.len()) {
            Some(end) if end <= MAX_FILE_SIZE => end,
            // 溢出的偏移和越过寻址上限一样，都落在索引树之外
            _ => return Err(FsError::OutOfRange),
        };

        let mut pos = offset;
        let mut written = 0;
        while pos < end {
            let chunk_end = cmp::min((pos / SECTOR_SIZE + 1) * SECTOR_SIZE, end);
            let chunk = chunk_end - pos;

            let sector =
                match layout::resolve(&self.ctx.cache, &*self.ctx.space, self.sector, pos, true) {
                    Ok(sector) => sector.expect("allocating resolve always yields a sector"),
                    Err(err) => {
                        return if written > 0 { Ok(written) } else { Err(err) };
                    }
                };

            {
                let mut guard = self.ctx.cache.write(sector);
                let start = pos % SECTOR_SIZE;
                guard.as_bytes_mut()[start..start + chunk]
                    .copy_from_slice(&buf[written..written + chunk]);
            }

            written += chunk;
            pos = chunk_end;

            // 数据进入缓存之后长度才生效；
            // 双重检查，并发的扩展写者不会把长度改小
            if chunk_end > self.length() {
                let _grow = self.grow.lock();
                if chunk_end > self.length() {
                    self.ctx
                        .cache
                        .write(self.sector)
                        .map_mut(0, |record: &mut InodeRecord| {
                            record.length = chunk_end as u32;
                        });
                }
            }
        }

        Ok(written)
    }

    /// 标记删除。物理回收推迟到最后一次 `close`
    pub fn remove(&self) {
        self.removed.store(true, Ordering::Release);
    }

    /// 关闭一次打开。计数归零时把手退出打开表；
    /// 若已标记删除，归还整棵索引树与记录扇区本身。
    pub fn close(&self) {
        let remaining = {
            let mut table = self.ctx.table.lock();
            let remaining = self.open_count.fetch_sub(1, Ordering::AcqRel) - 1;
            if remaining == 0 {
                table.remove(&self.sector);
            }
            remaining
        };
        if remaining > 0 {
            return;
        }

        if self.removed.load(Ordering::Acquire) {
            log::debug!("inode {:?}: reclaiming removed file", self.sector);
            layout::release_tree(&self.ctx.cache, &*self.ctx.space, self.sector);
            self.ctx.space.release(self.sector, 1);
        }
    }

    /// 拒绝对此 inode 的写入；每个打开者至多调用一次
    pub fn deny_write(&self) {
        self.deny_writes.fetch_add(1, Ordering::AcqRel);
    }

    /// 恢复写入，与 `deny_write` 成对使用
    pub fn allow_write(&self) {
        let prev = self.deny_writes.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }
}
