// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! coio CLI - small programs running on the coio runtime.

mod output;

use std::env;
use std::process;
use std::sync::Arc;

use parking_lot::Mutex;

use coio_rt::{co_write, Co, CoError, OpenMode, Runtime, RuntimeConfig};

fn main() {
    env_logger::init();
    output::init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return;
    }

    let result = match args[1].as_str() {
        "echo-server" => {
            if args.len() < 4 {
                usage_error("coio echo-server <host> <port>");
            }
            cmd_echo_server(args[2].clone(), parse_port(&args[3]))
        }
        "ping" => {
            if args.len() < 4 {
                usage_error("coio ping <host> <port> [message]");
            }
            let message = args.get(4).cloned().unwrap_or_else(|| "ping".to_string());
            cmd_ping(args[2].clone(), parse_port(&args[3]), message)
        }
        "cat" => {
            if args.len() < 3 {
                usage_error("coio cat <file>...");
            }
            cmd_cat(args[2..].to_vec())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("coio {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        other => {
            eprintln!("{}: unknown command: {}", output::error_label(), other);
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("{}: {}", output::error_label(), e);
        process::exit(1);
    }
}

fn print_usage() {
    println!("coio {} - cooperative fibers with blocking-style I/O", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: coio <command> [args]");
    println!();
    println!("Commands:");
    println!(
        "  {} {} {}  Echo every connection back to itself",
        output::command("echo-server"),
        output::arg("<host>"),
        output::arg("<port>")
    );
    println!(
        "  {} {} {} {}  Send a message and print the reply",
        output::command("ping"),
        output::arg("<host>"),
        output::arg("<port>"),
        output::arg("[msg]")
    );
    println!(
        "  {} {}                  Copy files to standard output",
        output::command("cat"),
        output::arg("<file>...")
    );
    println!("  {}                          Show this help", output::command("help"));
    println!("  {}                       Show version", output::command("version"));
    println!();
    println!("Environment: RUST_LOG, COIO_POLL_TIMEOUT_MS, COIO_MAX_EVENTS, COIO_FIBER_STACK_KB");
}

fn usage_error(usage: &str) -> ! {
    eprintln!("Usage: {}", usage);
    process::exit(1);
}

fn parse_port(s: &str) -> u16 {
    match s.parse() {
        Ok(port) => port,
        Err(_) => {
            eprintln!("{}: invalid port: {}", output::error_label(), s);
            process::exit(1);
        }
    }
}

/// Run `entry` on a fresh runtime; the fiber reports its own failure
/// through `outcome`.
fn run_program<F>(entry: F) -> Result<(), CoError>
where
    F: FnOnce(&Co) -> Result<(), CoError> + Send + 'static,
{
    let outcome = Arc::new(Mutex::new(None));
    let slot = outcome.clone();

    Runtime::new(RuntimeConfig::from_env())?.run(move |co| {
        *slot.lock() = Some(entry(co));
    })?;

    let result = outcome.lock().take();
    result.unwrap_or(Ok(()))
}

fn cmd_echo_server(host: String, port: u16) -> Result<(), CoError> {
    run_program(move |co| {
        let listener = co.bind_tcp(&host, port, 128)?;
        log::info!("echo server listening on {}", co.local_addr(listener)?);

        loop {
            let (conn, peer) = co.accept(listener)?;
            log::info!("connection from {}", peer);
            co.spawn(move |co| {
                if let Err(e) = echo(co, conn) {
                    log::warn!("connection from {} failed: {}", peer, e);
                }
                co.close(conn);
            })?;
        }
    })
}

fn echo(co: &Co, conn: coio_rt::Handle) -> Result<(), CoError> {
    let mut buf = [0u8; 4096];
    loop {
        match co.read(conn, &mut buf)? {
            0 => return Ok(()),
            n => co.write_all(conn, &buf[..n])?,
        }
    }
}

fn cmd_ping(host: String, port: u16, message: String) -> Result<(), CoError> {
    run_program(move |co| {
        let conn = co.connect_tcp(&host, port)?;
        co.write_all(conn, message.as_bytes())?;

        let mut buf = [0u8; 4096];
        let n = co.read(conn, &mut buf)?;
        co.close(conn);

        let out = co.stdout()?;
        co_write!(co, out, "{}\n", String::from_utf8_lossy(&buf[..n]))?;
        co.close(out);
        Ok(())
    })
}

fn cmd_cat(paths: Vec<String>) -> Result<(), CoError> {
    run_program(move |co| {
        let out = co.stdout()?;
        let mut buf = [0u8; 8192];

        for path in &paths {
            let file = co.open(path, OpenMode::ReadOnly, 0)?;
            loop {
                match co.read(file, &mut buf)? {
                    0 => break,
                    n => co.write_all(out, &buf[..n])?,
                }
            }
            co.close(file);
        }

        co.close(out);
        Ok(())
    })
}
