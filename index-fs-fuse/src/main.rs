use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use clap::{App, Arg};
use index_fs::{FileSystem, FsError, MountOptions};
use index_fs_fuse::BlockFile;

/// Sectors in an image when `--size` is not given (16 MiB)
const DEFAULT_IMAGE_SECTORS: usize = 32 * 1024;

fn fs_error(err: FsError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

fn main() -> io::Result<()> {
    env_logger::init();
    let matches = App::new("index-fs packer")
        .arg(
            Arg::with_name("source")
                .short("s")
                .long("source")
                .takes_value(true)
                .required(true)
                .help("Host directory whose files are packed"),
        )
        .arg(
            Arg::with_name("target")
                .short("t")
                .long("target")
                .takes_value(true)
                .required(true)
                .help("Directory the image is written to"),
        )
        .arg(
            Arg::with_name("image")
                .short("i")
                .long("image")
                .takes_value(true)
                .default_value("fs.img")
                .help("File name of the image"),
        )
        .arg(
            Arg::with_name("size")
                .long("size")
                .takes_value(true)
                .help("Image size in sectors"),
        )
        .arg(
            Arg::with_name("dir")
                .short("d")
                .long("dir")
                .takes_value(true)
                .help("Directory inside the image to pack into, created if missing"),
        )
        .get_matches();

    let source = Path::new(matches.value_of("source").unwrap_or("."));
    let target = Path::new(matches.value_of("target").unwrap_or("."));
    let image = target.join(matches.value_of("image").unwrap_or("fs.img"));
    let sectors = match matches.value_of("size") {
        Some(size) => size
            .parse::<usize>()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?,
        None => DEFAULT_IMAGE_SECTORS,
    };
    println!("source={:?}\nimage={:?} ({} sectors)", source, image, sectors);

    let block_file = Arc::new(BlockFile::create(&image, sectors)?);
    let fs = FileSystem::format(block_file, MountOptions::default()).map_err(fs_error)?;

    let mut cwd = None;
    if let Some(dir) = matches.value_of("dir") {
        match fs.mkdir(None, dir) {
            Ok(()) | Err(FsError::AlreadyExists) => {}
            Err(err) => return Err(fs_error(err)),
        }
        fs.chdir(&mut cwd, dir).map_err(fs_error)?;
    }

    let mut entries = fs::read_dir(source)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let data = fs::read(entry.path())?;
        fs.create(cwd.as_ref(), &name, 0, false).map_err(fs_error)?;
        let inode = fs.open(cwd.as_ref(), &name).map_err(fs_error)?;
        if inode.write_at(0, &data) != data.len() {
            return Err(fs_error(FsError::NoSpace));
        }
        println!("file: {:?} ({} bytes, inode {})", name, data.len(), inode.sector());
    }

    drop(cwd);
    fs.shutdown();
    println!("{} sectors free", fs.free_sectors());
    Ok(())
}
