use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use rlapd::{Client, Config, Role, Serial};

#[derive(Parser, Debug)]
struct Opt {
    #[clap(short = 'p', default_value = "/dev/null")]
    port: String,

    #[clap(short = 'b', default_value = "115200")]
    baud: u32,

    /// Use a fixed TEI instead of asking for one.
    #[clap(short = 't')]
    tei: Option<u8>,

    /// Run LAPB instead of LAPD.
    #[clap(long)]
    lapb: bool,

    /// Be the network (or DCE) side.
    #[clap(long)]
    network: bool,

    /// Write a pcap of all frames to this file.
    #[clap(short = 'w')]
    capture: Option<std::path::PathBuf>,

    #[clap(short = 'r')]
    cr: bool,

    #[clap(short = 'v', default_value = "0")]
    v: usize,
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    let done = Arc::new(AtomicBool::new(false));
    stderrlog::new()
        .module("rlapd")
        .verbosity(opt.v)
        .init()
        .unwrap();

    let mut config = if opt.lapb {
        Config::lapb()
    } else {
        Config::default()
    };
    if let Some(tei) = opt.tei {
        config = config.with_fixed_tei(tei);
    }
    if opt.network {
        config = config.with_role(Role::Network);
    }
    let phy = Serial::new(&opt.port, opt.baud)?;
    let mut c = Client::new(config, Box::new(phy))?;
    if let Some(filename) = opt.capture {
        c.capture(filename)?;
    }

    let d = done.clone();
    ctrlc::set_handler(move || {
        println!("Received SIGINT signal, shutting down...");
        d.store(true, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    let (tx, rx) = std::sync::mpsc::channel();

    let d = done.clone();
    let cr = opt.cr;
    std::thread::spawn(move || {
        use std::io::BufRead;
        while !d.load(Ordering::SeqCst) {
            let stdin = std::io::stdin();
            let mut iterator = stdin.lock().lines();
            if let Some(line) = iterator.next() {
                if cr {
                    tx.send(line.map(|s| s.trim_end().to_owned() + "\r"))
                        .unwrap();
                } else {
                    tx.send(line).unwrap();
                }
            }
        }
    });

    if opt.network {
        eprintln!("==== WAITING FOR PEER");
        while !c.accept(std::time::Instant::now() + std::time::Duration::from_secs(1))? {
            if done.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
    } else {
        eprintln!("==== CONNECTING");
        c.connect(std::time::Duration::from_secs(30))?;
    }
    while !done.load(Ordering::SeqCst) && !c.eof() {
        if let Ok(Some(data)) = c.read_until(done.clone()) {
            println!("{}", String::from_utf8_lossy(&data));
        }
        match rx.recv_timeout(std::time::Duration::from_secs(0)) {
            Ok(Ok(line)) => c.write(line.as_bytes())?,
            Ok(Err(e)) => eprintln!("Error reading line: {}", e),
            Err(_) => {}
        };
    }
    c.disconnect()?;
    eprintln!("==== DISCONNECTED, errors: {:?}", c.errors());
    Ok(())
}
