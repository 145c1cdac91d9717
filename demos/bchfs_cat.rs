use std::env;
use std::io::{self, Read, Write};

use bcachefs_rs::Bcachefs;
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = env::args();
    let program = args.next().unwrap_or_else(|| String::from("bchfs_cat"));
    let image_path = args
        .next()
        .ok_or_else(|| format!("usage: {program} <image.img> <path/in/image>"))?;
    let file_path = args
        .next()
        .ok_or_else(|| format!("usage: {program} <image.img> <path/in/image>"))?;

    info!(image_path, file_path, "starting bchfs_cat");
    let fs = Bcachefs::open(&image_path)?;
    let mut file = fs.open_file(&file_path)?;
    info!(file_size = file.size(), "prepared file reader");

    let stdout = io::stdout();
    let mut lock = stdout.lock();
    let mut block = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut block)?;
        if read == 0 {
            break;
        }
        debug!(read, "writing bytes to stdout");
        lock.write_all(&block[..read])?;
    }

    info!("finished bchfs_cat output");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
