use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sector_dev::{SectorDevice, SectorId};
use sparse_fs::{
    FreeSpace, FsError, Inode, InodeKind, SectorCache, SparseFileSystem, CACHE_SLOTS,
    MAX_FILE_SIZE, SECTOR_SIZE,
};

use crate::{BitmapSpace, Flusher, MemDisk};

const DISK_SECTORS: usize = 8192;
/// 0号扇区留给设备自身，1号是根目录记录
const RESERVED: usize = 2;

fn setup() -> (SparseFileSystem, Arc<BitmapSpace>, Arc<MemDisk>) {
    let dev = Arc::new(MemDisk::new(DISK_SECTORS));
    let space = Arc::new(BitmapSpace::new(DISK_SECTORS, RESERVED));
    let fs = SparseFileSystem::format(dev.clone(), space.clone());
    (fs, space, dev)
}

fn new_file(fs: &SparseFileSystem, space: &BitmapSpace, length: u32) -> Arc<Inode> {
    let sector = space.allocate(1).unwrap();
    fs.create_inode(sector, length, InodeKind::File);
    fs.open_inode(sector)
}

#[test]
fn sparse_read_is_zero_filled() {
    let (fs, space, _) = setup();
    let inode = new_file(&fs, &space, 4096);

    let mut buf = vec![0xA5u8; 4096];
    assert_eq!(inode.read_at(0, &mut buf), 4096);
    assert!(buf.iter().all(|&byte| byte == 0));

    // 越过文件末尾读不到任何字节
    assert_eq!(inode.read_at(4096, &mut buf), 0);
    assert_eq!(inode.read_at(10_000, &mut buf), 0);

    inode.close();
}

#[test]
fn write_then_read_back() {
    let (fs, space, _) = setup();
    let inode = new_file(&fs, &space, 0);

    // 跨扇区且不对齐的一段
    let data: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(inode.write_at(300, &data), Ok(data.len()));

    let mut back = vec![0u8; data.len()];
    assert_eq!(inode.read_at(300, &mut back), data.len());
    assert_eq!(back, data);

    // 文件开头的空洞仍然读出零
    let mut head = vec![0xFFu8; 300];
    assert_eq!(inode.read_at(0, &mut head), 300);
    assert!(head.iter().all(|&byte| byte == 0));

    inode.close();
}

#[test]
fn length_tracks_high_water_mark() {
    let (fs, space, _) = setup();
    let inode = new_file(&fs, &space, 0);

    assert_eq!(inode.write_at(0, &[1; 10]), Ok(10));
    assert_eq!(inode.length(), 10);
    assert_eq!(inode.write_at(5000, &[2; 100]), Ok(100));
    assert_eq!(inode.length(), 5100);
    // 回头写旧区域不会把长度改小
    assert_eq!(inode.write_at(100, &[3; 50]), Ok(50));
    assert_eq!(inode.length(), 5100);

    inode.close();
}

#[test]
fn double_indirect_growth() {
    let (fs, space, _) = setup();
    let inode = new_file(&fs, &space, 0);

    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 199) as u8 + 1).collect();
    assert_eq!(inode.write_at(600_000, &data), Ok(10_000));
    assert_eq!(inode.length(), 610_000);

    // 前 600_000 字节从未写过，逐块确认全零
    let mut buf = vec![0u8; 60_000];
    for chunk in 0..10 {
        let offset = chunk * buf.len();
        assert_eq!(inode.read_at(offset, &mut buf), buf.len());
        assert!(buf.iter().all(|&byte| byte == 0), "hole at {offset} not zero");
    }

    let mut back = vec![0u8; 10_000];
    assert_eq!(inode.read_at(600_000, &mut back), 10_000);
    assert_eq!(back, data);

    inode.close();
}

#[test]
fn eviction_round_trips_dirty_slots() {
    let (fs, space, dev) = setup();
    let inode = new_file(&fs, &space, 0);

    // 写入两倍于缓存容量的扇区，必然经历驱逐与写回
    let total = CACHE_SLOTS * 2;
    for index in 0..total {
        let sector_data = vec![(index % 255) as u8 + 1; SECTOR_SIZE];
        assert_eq!(
            inode.write_at(index * SECTOR_SIZE, &sector_data),
            Ok(SECTOR_SIZE)
        );
    }
    assert!(dev.writes() > 0, "eviction should have written back");

    let mut back = vec![0u8; SECTOR_SIZE];
    for index in 0..total {
        assert_eq!(inode.read_at(index * SECTOR_SIZE, &mut back), SECTOR_SIZE);
        assert!(back.iter().all(|&byte| byte == (index % 255) as u8 + 1));
    }

    inode.close();
}

/// 写回故意放慢的设备，拉大驱逐中的写回窗口
struct SlowWrites {
    inner: MemDisk,
    delay: Duration,
}

impl SectorDevice for SlowWrites {
    fn read_sector(&self, sector: SectorId, buf: &mut [u8]) {
        self.inner.read_sector(sector, buf);
    }

    fn write_sector(&self, sector: SectorId, buf: &[u8]) {
        thread::sleep(self.delay);
        self.inner.write_sector(sector, buf);
    }
}

#[test]
fn eviction_write_back_is_ordered_before_reload() {
    let dev = Arc::new(SlowWrites {
        inner: MemDisk::new(256),
        delay: Duration::from_millis(20),
    });
    let cache = Arc::new(SectorCache::new(dev));
    let victim = SectorId::new(5);
    cache.write(victim).fill(0xEE);

    // 另一线程绑满全部槽位，把脏的受害者驱逐出去
    let evictor = {
        let cache = cache.clone();
        thread::spawn(move || {
            for raw in 100..100 + CACHE_SLOTS as u32 {
                let _ = cache.read(SectorId::new(raw));
            }
        })
    };

    // 与慢速写回并发地反复重读；任何一次读到旧字节都算丢失写入
    for _ in 0..32 {
        let guard = cache.read(victim);
        assert_eq!(
            guard.as_bytes()[0],
            0xEE,
            "dirty victim re-read before its write-back landed"
        );
        drop(guard);
        thread::yield_now();
    }
    evictor.join().unwrap();
}

#[test]
fn flush_writes_through_to_device() {
    let (fs, space, dev) = setup();
    let inode = new_file(&fs, &space, 0);

    let data = vec![0x5Au8; SECTOR_SIZE];
    assert_eq!(inode.write_at(0, &data), Ok(SECTOR_SIZE));
    fs.flush();

    // 确定性的首次适配分配器：记录占2号扇区，首个数据扇区是3号
    assert_eq!(dev.sector_bytes(SectorId::new(3)), data);

    inode.close();
}

#[test]
fn background_flusher_syncs_periodically() {
    let (fs, space, dev) = setup();
    let inode = new_file(&fs, &space, 0);
    let flusher = Flusher::spawn(fs.cache().clone(), Duration::from_millis(20));

    let before = dev.writes();
    assert_eq!(inode.write_at(0, &[0xC3; 512]), Ok(512));
    thread::sleep(Duration::from_millis(200));
    assert!(dev.writes() > before, "flusher never wrote back");

    drop(flusher);
    inode.close();
}

#[test]
fn removed_file_stays_usable_until_last_close() {
    let (fs, space, _) = setup();
    let baseline = space.in_use();

    let first = new_file(&fs, &space, 0);
    let second = fs.open_inode(first.sector());
    assert!(Arc::ptr_eq(&first, &second));

    assert_eq!(first.write_at(0, &[7; 2048]), Ok(2048));
    first.remove();
    first.close();

    // 另一个打开者仍可读写
    let mut back = vec![0u8; 2048];
    assert_eq!(second.read_at(0, &mut back), 2048);
    assert!(back.iter().all(|&byte| byte == 7));
    assert_eq!(second.write_at(2048, &[8; 512]), Ok(512));

    assert!(space.in_use() > baseline);
    second.close();
    // 最后一次关闭之后，索引树和记录扇区全部归还
    assert_eq!(space.in_use(), baseline);
}

#[test]
fn deny_write_blocks_writers() {
    let (fs, space, _) = setup();
    let inode = new_file(&fs, &space, 0);

    inode.deny_write();
    assert_eq!(inode.write_at(0, &[1; 16]), Ok(0));
    assert_eq!(inode.length(), 0);

    inode.allow_write();
    assert_eq!(inode.write_at(0, &[1; 16]), Ok(16));

    inode.close();
}

#[test]
fn write_beyond_addressable_range_is_rejected() {
    let (fs, space, _) = setup();
    let inode = new_file(&fs, &space, 0);

    assert_eq!(inode.write_at(MAX_FILE_SIZE, &[1]), Err(FsError::OutOfRange));
    assert_eq!(
        inode.write_at(MAX_FILE_SIZE - 2, &[1; 4]),
        Err(FsError::OutOfRange)
    );
    // 偏移加长度回绕也按越界处理，读则照常到不了文件末尾
    assert_eq!(
        inode.write_at(usize::MAX - 4, &[1; 16]),
        Err(FsError::OutOfRange)
    );
    let mut buf = [0u8; 16];
    assert_eq!(inode.read_at(usize::MAX - 4, &mut buf), 0);
    assert_eq!(inode.length(), 0);

    inode.close();
}

#[test]
fn kind_flip_survives_reopen() {
    let dev = Arc::new(MemDisk::new(DISK_SECTORS));
    let space = Arc::new(BitmapSpace::new(DISK_SECTORS, RESERVED));
    let sector = {
        let fs = SparseFileSystem::format(dev.clone(), space.clone());
        let inode = new_file(&fs, &space, 0);
        assert!(!inode.is_dir());
        inode.set_dir(true);
        assert!(inode.is_dir());

        let sector = inode.sector();
        inode.close();
        fs.flush();
        sector
    };

    let fs = SparseFileSystem::open(dev, space);
    let inode = fs.open_inode(sector);
    assert!(inode.is_dir());
    inode.set_dir(false);
    assert!(!inode.is_dir());
    inode.close();
}

#[test]
fn out_of_space_reports_partial_progress() {
    let dev = Arc::new(MemDisk::new(8));
    let space = Arc::new(BitmapSpace::new(8, RESERVED));
    let fs = SparseFileSystem::format(dev, space.clone());
    let inode = new_file(&fs, &space, 0);

    // 记录占去一个扇区，还剩5个数据扇区
    let data = vec![9u8; 16 * SECTOR_SIZE];
    assert_eq!(inode.write_at(0, &data), Ok(5 * SECTOR_SIZE));
    assert_eq!(inode.length(), 5 * SECTOR_SIZE);

    // 一个字节都写不进去时才报错
    assert_eq!(
        inode.write_at(5 * SECTOR_SIZE, &[9; 16]),
        Err(FsError::OutOfSpace)
    );

    inode.close();
}

#[test]
fn reopen_validates_root_record() {
    let dev = Arc::new(MemDisk::new(DISK_SECTORS));
    let space = Arc::new(BitmapSpace::new(DISK_SECTORS, RESERVED));
    {
        let fs = SparseFileSystem::format(dev.clone(), space.clone());
        let root = fs.root();
        assert!(root.is_dir());
        root.close();
        fs.flush();
    }

    let fs = SparseFileSystem::open(dev, space);
    let root = fs.root();
    assert!(root.is_dir());
    assert_eq!(root.length(), 0);
    root.close();
}

#[test]
fn concurrent_writers_never_tear_reads() {
    let dev = Arc::new(MemDisk::new(64));
    let cache = Arc::new(SectorCache::new(dev));
    let sector = SectorId::new(5);

    let writers: Vec<_> = (1u8..=4)
        .map(|pattern| {
            let cache = cache.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    let mut guard = cache.write(sector);
                    guard.fill(pattern);
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let cache = cache.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    let guard = cache.read(sector);
                    let bytes = guard.as_bytes();
                    let first = bytes[0];
                    // 写者独占，读者看不到写了一半的扇区
                    assert!(bytes.iter().all(|&byte| byte == first));
                }
            })
        })
        .collect();

    for handle in writers.into_iter().chain(readers) {
        handle.join().unwrap();
    }
}

#[test]
fn concurrent_extension_keeps_both_writes() {
    let (fs, space, _) = setup();
    let inode = new_file(&fs, &space, 0);

    let low = {
        let inode = inode.clone();
        thread::spawn(move || {
            assert_eq!(inode.write_at(100_000, &[0xAA; 8192]), Ok(8192));
        })
    };
    let high = {
        let inode = inode.clone();
        thread::spawn(move || {
            assert_eq!(inode.write_at(200_000, &[0xBB; 8192]), Ok(8192));
        })
    };
    low.join().unwrap();
    high.join().unwrap();

    // 长度收敛到最大的写入末尾
    assert_eq!(inode.length(), 208_192);

    let mut buf = vec![0u8; 8192];
    assert_eq!(inode.read_at(100_000, &mut buf), 8192);
    assert!(buf.iter().all(|&byte| byte == 0xAA));
    assert_eq!(inode.read_at(200_000, &mut buf), 8192);
    assert!(buf.iter().all(|&byte| byte == 0xBB));

    // 两段之间的空洞保持为零
    assert_eq!(inode.read_at(150_000, &mut buf), 8192);
    assert!(buf.iter().all(|&byte| byte == 0));

    inode.close();
}

#[test]
fn cache_pressure_with_many_open_files() {
    let (fs, space, _) = setup();

    // 文件数超过缓存槽位数，驱逐与重载交错进行
    let inodes: Vec<_> = (0..CACHE_SLOTS + 16)
        .map(|index| {
            let inode = new_file(&fs, &space, 0);
            assert_eq!(
                inode.write_at(0, &[(index % 255) as u8 + 1; 64]),
                Ok(64)
            );
            inode
        })
        .collect();

    let mut back = [0u8; 64];
    for (index, inode) in inodes.iter().enumerate() {
        assert_eq!(inode.read_at(0, &mut back), 64);
        assert!(back.iter().all(|&byte| byte == (index % 255) as u8 + 1));
        inode.close();
    }
}
