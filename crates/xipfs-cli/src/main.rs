#![forbid(unsafe_code)]
//! Command-line tools for xipfs image files.
//!
//! Operates on a file-backed NVM image, so file systems prepared here
//! can be flashed to a device or inspected across invocations.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use xipfs::{FileNvm, Mount, Nvm, OpenFlags, PAGE_SIZE, XIPFS_MAGIC, Xipfs};

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "xipfs", about = "xipfs — execute-in-place file system tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create (or wipe) an image file holding an empty file system.
    Format {
        /// Path to the image file.
        image: PathBuf,
        /// Number of erase pages in the image.
        #[arg(long, default_value_t = 64)]
        pages: u32,
    },
    /// List a directory.
    Ls {
        image: PathBuf,
        /// Directory to list.
        #[arg(default_value = "/")]
        path: String,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Print a file's contents to stdout.
    Cat { image: PathBuf, path: String },
    /// Write data into a file, creating it if needed.
    Write {
        image: PathBuf,
        path: String,
        /// Literal data to write; stdin is used when omitted.
        #[arg(long)]
        data: Option<String>,
        /// Append instead of overwriting.
        #[arg(long)]
        append: bool,
    },
    /// Create a file with an explicit reservation and exec flag.
    New {
        image: PathBuf,
        path: String,
        /// Bytes to reserve (rounded up to whole pages).
        #[arg(long, default_value_t = 0)]
        size: u32,
        /// Mark the file executable.
        #[arg(long)]
        exec: bool,
    },
    /// Create a directory.
    Mkdir { image: PathBuf, path: String },
    /// Remove a file.
    Rm { image: PathBuf, path: String },
    /// Remove an empty directory.
    Rmdir { image: PathBuf, path: String },
    /// Rename a file or directory.
    Mv {
        image: PathBuf,
        from: String,
        to: String,
    },
    /// Show capacity information.
    Df {
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Show a file's metadata.
    Stat {
        image: PathBuf,
        path: String,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Show the mount structure read through the virtual info file.
    Info {
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

// ── Serializable outputs ────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InfoOutput {
    magic: u32,
    base: u64,
    pages: u32,
    page_size: u32,
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Format { image, pages } => format_cmd(&image, pages),
        Command::Ls { image, path, json } => ls(&image, &path, json),
        Command::Cat { image, path } => cat(&image, &path),
        Command::Write {
            image,
            path,
            data,
            append,
        } => write_cmd(&image, &path, data.as_deref(), append),
        Command::New {
            image,
            path,
            size,
            exec,
        } => new_cmd(&image, &path, size, exec),
        Command::Mkdir { image, path } => with_fs(&image, |fs| Ok(fs.mkdir(&path)?)),
        Command::Rm { image, path } => with_fs(&image, |fs| Ok(fs.unlink(&path)?)),
        Command::Rmdir { image, path } => with_fs(&image, |fs| Ok(fs.rmdir(&path)?)),
        Command::Mv { image, from, to } => with_fs(&image, |fs| Ok(fs.rename(&from, &to)?)),
        Command::Df { image, json } => df(&image, json),
        Command::Stat { image, path, json } => stat_cmd(&image, &path, json),
        Command::Info { image, json } => info_cmd(&image, json),
    }
}

fn open_fs(image: &Path) -> Result<Xipfs<FileNvm>> {
    let nvm = FileNvm::open(image)
        .with_context(|| format!("failed to open image {}", image.display()))?;
    let pages = nvm.page_count();
    let fs = Xipfs::new(nvm, Mount::new(0, pages)).context("invalid mount structure")?;
    fs.mount().context("image failed the mount check")?;
    Ok(fs)
}

fn with_fs(image: &Path, op: impl FnOnce(&Xipfs<FileNvm>) -> Result<()>) -> Result<()> {
    let fs = open_fs(image)?;
    op(&fs)?;
    fs.sync()?;
    Ok(())
}

fn format_cmd(image: &Path, pages: u32) -> Result<()> {
    if pages == 0 {
        bail!("an image needs at least one page");
    }
    let nvm = FileNvm::create(image, pages)
        .with_context(|| format!("failed to create image {}", image.display()))?;
    let fs = Xipfs::new(nvm, Mount::new(0, pages))?;
    fs.format()?;
    fs.sync()?;
    println!(
        "formatted {} ({pages} pages of {} bytes)",
        image.display(),
        PAGE_SIZE
    );
    Ok(())
}

fn ls(image: &Path, path: &str, json: bool) -> Result<()> {
    let fs = open_fs(image)?;
    let mut dir = fs.opendir(path)?;
    let mut names = Vec::new();
    while let Some(entry) = fs.readdir(&mut dir)? {
        names.push(entry.name);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&names)?);
    } else {
        for name in names {
            println!("{name}");
        }
    }
    Ok(())
}

fn cat(image: &Path, path: &str) -> Result<()> {
    let fs = open_fs(image)?;
    let fd = fs.open(path, OpenFlags::RDONLY)?;

    let mut stdout = std::io::stdout().lock();
    let mut chunk = [0_u8; PAGE_SIZE];
    loop {
        let n = fs.read(fd, &mut chunk)?;
        if n == 0 {
            break;
        }
        stdout.write_all(&chunk[..n])?;
    }
    fs.close(fd)?;
    Ok(())
}

fn write_cmd(image: &Path, path: &str, data: Option<&str>, append: bool) -> Result<()> {
    let bytes = match data {
        Some(text) => text.as_bytes().to_vec(),
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            buf
        }
    };

    let fs = open_fs(image)?;
    let mut flags = OpenFlags::CREAT | OpenFlags::WRONLY;
    if append {
        flags |= OpenFlags::APPEND;
    }
    let fd = fs.open(path, flags)?;
    let written = fs.write(fd, &bytes)?;
    fs.fsync(fd)?;
    fs.close(fd)?;
    fs.sync()?;

    if written < bytes.len() {
        bail!("short write: {written} of {} bytes (reservation exhausted)", bytes.len());
    }
    Ok(())
}

fn new_cmd(image: &Path, path: &str, size: u32, exec: bool) -> Result<()> {
    with_fs(image, |fs| Ok(fs.new_file(path, size, u32::from(exec))?))
}

fn df(image: &Path, json: bool) -> Result<()> {
    let fs = open_fs(image)?;
    let vfs = fs.statvfs("/")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&vfs)?);
    } else {
        println!("pages      {}", vfs.blocks);
        println!("free       {}", vfs.bfree);
        println!("page size  {}", vfs.bsize);
    }
    Ok(())
}

fn stat_cmd(image: &Path, path: &str, json: bool) -> Result<()> {
    let fs = open_fs(image)?;
    let stat = fs.stat(path)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stat)?);
    } else {
        println!("{path}: {:?}, {} bytes, {} pages", stat.kind, stat.size, stat.blocks);
    }
    Ok(())
}

fn info_cmd(image: &Path, json: bool) -> Result<()> {
    let fs = open_fs(image)?;
    let fd = fs.open("/.xipfs_infos", OpenFlags::RDONLY)?;
    let mut raw = [0_u8; Mount::INFO_LEN];
    let n = fs.read(fd, &mut raw)?;
    fs.close(fd)?;
    if n != raw.len() {
        bail!("short read from the info file");
    }

    let info = InfoOutput {
        magic: u32::from_ne_bytes(raw[0..4].try_into().expect("4 bytes")),
        base: u64::from_ne_bytes(raw[4..12].try_into().expect("8 bytes")),
        pages: u32::from_ne_bytes(raw[12..16].try_into().expect("4 bytes")),
        page_size: PAGE_SIZE as u32,
    };
    if info.magic != XIPFS_MAGIC {
        bail!("unexpected magic {:#x}", info.magic);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("magic      {:#010x}", info.magic);
        println!("base       {:#x}", info.base);
        println!("pages      {}", info.pages);
        println!("page size  {}", info.page_size);
    }
    Ok(())
}
