use std::io::Write;

use anyhow::Result;
use clap::Parser;
use tokio::io::AsyncReadExt;
use tokio_serial::SerialPortBuilderExt;

use rlapd::r#async::Client;
use rlapd::Config;

#[derive(Parser, Debug)]
struct Opt {
    #[clap(short = 'p', default_value = "/dev/null")]
    port: String,

    #[clap(short = 'b', default_value = "115200")]
    baud: u32,

    #[clap(short = 't')]
    tei: Option<u8>,

    #[clap(long)]
    lapb: bool,

    #[clap(short = 'r')]
    cr: bool,

    #[clap(short = 'v', default_value = "0")]
    v: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();
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
    let port = tokio_serial::new(&opt.port, opt.baud).open_native_async()?;
    let mut stdin = tokio::io::stdin();
    let mut client = Client::connect(config, port).await?;
    println!("Connected, TEI {:?}", client.link()?.tei());
    let mut sigint = {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::interrupt())?
    };
    loop {
        let mut buf = [0; 1024];
        tokio::select! {
            _ = sigint.recv() => {
                eprintln!("Sigint received");
                break;
            },
            res = stdin.read(&mut buf) => {
                let res = res?;
                if res == 0 {
                    eprintln!("Got EOF from stdin");
                    break;
                }
                let buf = &buf[..res];
                if buf == b"exit\n" {
                    eprintln!("Got 'exit' from user");
                    break;
                }
                let buf: Vec<_> = if opt.cr {
                    buf.iter().map(|&b| if b == b'\n' { b'\r' } else { b }).collect()
                } else {
                    buf.to_vec()
                };
                client.write(&buf).await?;
            },
            data = client.read() => {
                let data = data?;
                if data.is_empty() {
                    eprintln!("Got EOF");
                    break;
                }
                let s = String::from_utf8_lossy(&data);
                let s = if opt.cr { s.replace('\r', "\n") } else { s.into_owned() };
                print!("{s}");
                std::io::stdout().flush()?;
            },
        }
    }
    eprintln!("End of main loop");
    client.disconnect().await?;
    eprintln!("Disconnected");
    Ok(())
}
