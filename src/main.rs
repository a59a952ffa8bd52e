use anyhow::Result;
use bootdisk::{DiskImageBuilder, BOOT_PARTITION_SLOT, SECTOR_SIZE};
use std::{env, path::PathBuf, process};

struct Args {
    bootloader: PathBuf,
    kernel: PathBuf,
    out: PathBuf,
}

fn usage() -> ! {
    eprintln!("usage: bootdisk -b <bootloader> -k <kernel> -o <out>");
    process::exit(2);
}

fn parse_args() -> Args {
    let mut bootloader = None;
    let mut kernel = None;
    let mut out = None;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-b" | "--bootloader" => bootloader = args.next().map(PathBuf::from),
            "-k" | "--kernel" => kernel = args.next().map(PathBuf::from),
            "-o" | "--out" => out = args.next().map(PathBuf::from),
            _ => usage(),
        }
    }

    match (bootloader, kernel, out) {
        (Some(bootloader), Some(kernel), Some(out)) => Args {
            bootloader,
            kernel,
            out,
        },
        _ => usage(),
    }
}

fn run(args: &Args) -> Result<()> {
    let builder = DiskImageBuilder::new(&args.bootloader, &args.kernel);
    let region = builder.create_mbr_disk(&args.out)?;

    println!(
        "Copied {} to {}.",
        args.bootloader.display(),
        args.out.display()
    );
    println!(
        "Wrote kernel: {} bytes ({} sectors) at {}.",
        region.length,
        region.length / SECTOR_SIZE,
        region.base
    );
    println!("Patched partition entry {}.", BOOT_PARTITION_SLOT);
    Ok(())
}

fn main() {
    let args = parse_args();
    if let Err(err) = run(&args) {
        eprintln!("Error: {err:#}");
        process::exit(1);
    }
}
