mod cli;

use std::fs::OpenOptions;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use clap::Parser;
use cli::Cli;
use sparse_fs::{FreeSpace, InodeKind, SparseFileSystem, MAX_FILE_SIZE};
use sparse_fs_fuse::{BitmapSpace, Flusher, SectorFile};

/// xorshift64，给每个工作线程一条独立的随机序列
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

fn main() -> io::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    println!(
        "image={:?} sectors={} threads={} rounds={}",
        cli.image, cli.sectors, cli.threads, cli.rounds
    );

    let dev = Arc::new(SectorFile(Mutex::new({
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&cli.image)?;
        fd.set_len((cli.sectors * sparse_fs::SECTOR_SIZE) as u64)?;

        fd
    })));

    let space = Arc::new(BitmapSpace::new(cli.sectors, 2));
    let fs = Arc::new(SparseFileSystem::format(dev, space.clone()));
    let _flusher = Flusher::spawn(fs.cache().clone(), Duration::from_secs(1));

    let workers: Vec<_> = (0..cli.threads)
        .map(|id| {
            let fs = fs.clone();
            let space = space.clone();
            let rounds = cli.rounds;
            thread::spawn(move || {
                let mut rng = Rng(0x9E37_79B9 + id as u64);
                let sector = space.allocate(1).expect("record sector");
                fs.create_inode(sector, 0, InodeKind::File);
                let inode = fs.open_inode(sector);

                for round in 0..rounds {
                    let offset = (rng.next() as usize) % (MAX_FILE_SIZE / 4);
                    let len = 1 + (rng.next() as usize) % 4096;
                    let data: Vec<u8> =
                        (0..len).map(|i| (rng.next() as u8) ^ i as u8).collect();

                    let written = match inode.write_at(offset, &data) {
                        Ok(written) => written,
                        // 空间耗尽时提前收工，已写入的部分仍要校验
                        Err(err) => {
                            log::warn!("worker {id} round {round}: {err:?}");
                            break;
                        }
                    };

                    let mut back = vec![0u8; written];
                    assert_eq!(inode.read_at(offset, &mut back), written);
                    assert_eq!(back.as_slice(), &data[..written]);
                }

                inode.remove();
                inode.close();
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("worker panicked");
    }

    fs.flush();
    println!("done, sectors still in use: {}", space.in_use());

    Ok(())
}
