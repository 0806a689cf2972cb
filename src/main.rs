use anyhow::{anyhow, bail, Result};
use clap::{arg, command, ArgAction};
use exa_vrt::desc::{sectors_to_bytes, RDEV_RESERVED_AREA_IN_SECTORS};
use exa_vrt::group::{read_sb_area, write_sb_area};
use exa_vrt::rdev_sb::{RdevSuperblock, RDEV_SUPERBLOCK_SIZE};
use exa_vrt::stream::{MemoryStream, StreamAccess};
use exa_vrt::superblock::{superblock_read, SuperblockHeader};
use exa_vrt::ExaUuid;
use log::*;
use nbd_driver::{FileNbdDriver, NbdDriver};

fn read_identity_block(driver: &mut FileNbdDriver) -> Result<Vec<u8>> {
    let mut block = vec![0u8; sectors_to_bytes(RDEV_RESERVED_AREA_IN_SECTORS) as usize];
    driver.nbd_read(0, &mut block)?;
    Ok(block)
}

fn cmd_print(driver: &mut FileNbdDriver) -> Result<()> {
    let block = read_identity_block(driver)?;
    match RdevSuperblock::unpack(&block) {
        Ok(sb) => println!("exanodes disk, uuid {}", sb.uuid),
        Err(_) => println!("no exanodes superblock on this device"),
    }
    Ok(())
}

fn cmd_write(driver: &mut FileNbdDriver, uuid: Option<&String>) -> Result<()> {
    let uuid = match uuid {
        Some(s) => s.parse::<ExaUuid>()
            .map_err(|_| anyhow!("'{}' is not a valid uuid", s))?,
        None => ExaUuid::generate(),
    };

    let sb = RdevSuperblock::new(uuid);
    driver.nbd_write(0, &sb.pack())?;
    info!("wrote superblock");
    println!("{}", uuid);
    Ok(())
}

fn cmd_wipe(driver: &mut FileNbdDriver) -> Result<()> {
    let mut block = read_identity_block(driver)?;
    if RdevSuperblock::unpack(&block).is_err() {
        warn!("device carries no exanodes superblock, wiping anyway");
    }
    RdevSuperblock::wipe(&mut block);
    driver.nbd_write(0, &block[..RDEV_SUPERBLOCK_SIZE])?;
    println!("superblock wiped");
    Ok(())
}

fn cmd_headers(driver: &mut FileNbdDriver) -> Result<()> {
    let mut area = read_sb_area(driver)
        .map_err(|err| anyhow!("cannot read superblock area: {}", err))?;

    let headers = {
        let mut stream = MemoryStream::new(&mut area, StreamAccess::Read);
        SuperblockHeader::read_both(&mut stream)
            .map_err(|err| anyhow!("cannot parse superblock headers: {}", err))?
    };

    for header in &headers {
        println!("slot {}:", header.position);
        println!("  magic:     {:#010X}", header.magic);
        println!("  format:    {}", header.format);
        println!("  version:   {}", header.sb_version);
        println!("  data size: {} / {} bytes", header.data_size, header.data_max_size);
        println!("  checksum:  {:#06X}", header.checksum);
    }

    match superblock_read(&mut area) {
        Ok((version, payload)) => {
            println!("authoritative copy: version {}, {} bytes", version, payload.len());
        }
        Err(err) => println!("no valid superblock copy: {}", err),
    }
    Ok(())
}

fn cmd_zero_area(driver: &mut FileNbdDriver) -> Result<()> {
    let area = vec![0u8; exa_vrt::superblock::SB_AREA_BYTES as usize];
    write_sb_area(driver, &area).map_err(|err| anyhow!("wipe failed: {}", err))?;
    println!("group superblock area zeroed");
    Ok(())
}

fn main() -> Result<()> {
    let matches = command!() // requires `cargo` feature
        .about("Examine and edit the exanodes superblocks of a disk")
        .arg(arg!(<command> "One of: print, write, wipe, headers, zero-area"))
        .arg(arg!(-d --device <FILE> "Device path (or device image file)")
            .required(true))
        .arg(arg!(-u --uuid <UUID> "Disk uuid for 'write' (random if omitted)")
            .required(false))
        .arg(arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`")
            .action(ArgAction::SetTrue)
            .required(false))
        .get_matches();

    if matches.get_flag("verbose") {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    let device = matches.get_one::<String>("device").unwrap();
    let mut driver = FileNbdDriver::new(device);
    driver.nbd_open()?;

    let command = matches.get_one::<String>("command").unwrap();
    let result = match command.as_str() {
        "print" => cmd_print(&mut driver),
        "write" => cmd_write(&mut driver, matches.get_one::<String>("uuid")),
        "wipe" => cmd_wipe(&mut driver),
        "headers" => cmd_headers(&mut driver),
        "zero-area" => cmd_zero_area(&mut driver),
        other => bail!("unknown command '{}'", other),
    };

    driver.nbd_close()?;
    result
}
