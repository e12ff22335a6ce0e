//! shmview CLI - attach to, inspect and exercise external shared memory
//!
//!   - attach/peek: look at a segment someone else created
//!   - check: run one request through the handler
//!   - demo: self-contained run of the worker pool over private segments

use clap::{Parser, Subcommand};
use console::style;
use shmview::allocator::SysvSegment;
use shmview::{
    Attach, Executor, ExecutorConfig, Locator, Posix, Registry, Request, Result, Service, SysV,
    SENTINEL,
};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shmview")]
#[command(about = "External shared memory segment manager", long_about = None)]
struct Cli {
    /// Worker threads used to run requests
    #[arg(short, long, global = true, default_value = "1")]
    threads: usize,

    /// Log filter, e.g. "info" or "shmview=debug"
    #[arg(long, global = true, default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach to a segment and print its size
    Attach {
        shm_id: u64,

        /// Resolve the id as the POSIX object /<prefix>_<shm_id>
        #[arg(long)]
        posix: Option<String>,
    },

    /// Print u64 words of a segment
    Peek {
        shm_id: u64,

        /// Byte offset of the first word
        #[arg(short, long, default_value = "0")]
        offset: usize,

        /// Number of words
        #[arg(short, long, default_value = "4")]
        count: usize,

        #[arg(long)]
        posix: Option<String>,
    },

    /// Run one batch request: verify [batch_id, 0xDEADBEEF] and claim it
    Check {
        shm_id: u64,

        #[arg(short, long, default_value = "0")]
        offset: u64,

        #[arg(short, long, default_value = "16")]
        size: u64,

        #[arg(short, long)]
        batch_id: u64,

        #[arg(long)]
        posix: Option<String>,
    },

    /// Create private segments and push requests through the worker pool
    Demo {
        /// Number of segments to create
        #[arg(long, default_value = "4")]
        segments: usize,

        /// Requests (slots) per segment
        #[arg(long, default_value = "1024")]
        requests: usize,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log))
        .init();

    let config = ExecutorConfig {
        threads: cli.threads,
        ..Default::default()
    };

    let outcome = match cli.command {
        Commands::Attach { shm_id, posix } => {
            with_backend(posix, |registry| attach(registry, shm_id))
        }
        Commands::Peek {
            shm_id,
            offset,
            count,
            posix,
        } => with_backend(posix, |registry| peek(registry, shm_id, offset, count)),
        Commands::Check {
            shm_id,
            offset,
            size,
            batch_id,
            posix,
        } => {
            let request = Request::new(batch_id, Locator { shm_id, offset, size });
            with_backend(posix, |registry| check(registry, config.clone(), request))
        }
        Commands::Demo { segments, requests } => demo(config, segments, requests),
    };

    if let Err(e) = outcome {
        eprintln!("{} {}", style("error:").red().bold(), e);
        std::process::exit(1);
    }
}

/// Run `f` against a registry of the requested backend
fn with_backend<F>(posix: Option<String>, f: F) -> Result<()>
where
    F: FnOnce(Box<dyn Handler>) -> Result<()>,
{
    match posix {
        Some(prefix) => f(Box::new(Arc::new(Registry::with_attacher(Posix::new(prefix))))),
        None => f(Box::new(Arc::new(Registry::with_attacher(SysV)))),
    }
}

/// Object-safe slice of the registry the subcommands need
trait Handler {
    fn attach(&self, shm_id: u64) -> Result<(usize, usize)>;
    fn read_words(&self, shm_id: u64, offset: usize, count: usize) -> Result<Vec<u64>>;
    fn executor(&self, config: ExecutorConfig) -> Result<Executor>;
}

impl<A: Attach + 'static> Handler for Arc<Registry<A>> {
    fn attach(&self, shm_id: u64) -> Result<(usize, usize)> {
        let handle = self.get_or_attach(shm_id)?;
        Ok((handle.as_ptr() as usize, handle.size()))
    }

    fn read_words(&self, shm_id: u64, offset: usize, count: usize) -> Result<Vec<u64>> {
        let len = count.saturating_mul(std::mem::size_of::<u64>());
        let view = self.acquire(shm_id, offset, len)?;
        (0..count).map(|i| view.read::<u64>(i)).collect()
    }

    fn executor(&self, config: ExecutorConfig) -> Result<Executor> {
        Executor::start(config, Service::new(self.clone()))
    }
}

fn attach(registry: Box<dyn Handler>, shm_id: u64) -> Result<()> {
    let (addr, size) = registry.attach(shm_id)?;
    println!(
        "shm_id {} attached at {:#x}, {} bytes",
        style(shm_id).cyan(),
        addr,
        style(size).green()
    );
    Ok(())
}

fn peek(registry: Box<dyn Handler>, shm_id: u64, offset: usize, count: usize) -> Result<()> {
    let words = registry.read_words(shm_id, offset, count)?;
    for (i, word) in words.iter().enumerate() {
        let at = offset + i * std::mem::size_of::<u64>();
        let note = if *word == SENTINEL { " (sentinel)" } else { "" };
        println!("  +{:<8} {:#018x} {}{}", at, word, word, style(note).dim());
    }
    Ok(())
}

fn check(registry: Box<dyn Handler>, config: ExecutorConfig, request: Request) -> Result<()> {
    let executor = registry.executor(config)?;
    let response = executor.call(request)?;
    println!(
        "{} batch {} claimed",
        style("ok:").green().bold(),
        response.batch_id
    );
    Ok(())
}

fn demo(config: ExecutorConfig, segments: usize, requests: usize) -> Result<()> {
    let slot = 2 * std::mem::size_of::<u64>();
    let owned = (0..segments)
        .map(|_| SysvSegment::create(requests.max(1) * slot))
        .collect::<Result<Vec<_>>>()?;

    // Every slot starts as [batch_id, SENTINEL]
    let mut batch_id = 0u64;
    for segment in &owned {
        let words: Vec<u64> = (0..requests)
            .flat_map(|_| {
                batch_id += 1;
                [batch_id, SENTINEL]
            })
            .collect();
        segment.write_words(0, &words)?;
    }

    let registry = Arc::new(Registry::new());
    let executor = Executor::start(config, Service::new(registry.clone()))?;
    println!(
        "Running {} requests over {} segments with {} workers",
        segments * requests,
        segments,
        executor.threads()
    );

    let start = Instant::now();
    let mut pending = Vec::with_capacity(segments * requests);
    let mut batch_id = 0u64;
    for segment in &owned {
        for i in 0..requests {
            batch_id += 1;
            let locator = Locator {
                shm_id: segment.id(),
                offset: (i * slot) as u64,
                size: slot as u64,
            };
            pending.push(executor.submit(Request::new(batch_id, locator))?);
        }
    }

    let (mut ok, mut failed) = (0usize, 0usize);
    for p in pending {
        match p.wait() {
            Ok(_) => ok += 1,
            Err(_) => failed += 1,
        }
    }
    let elapsed = start.elapsed();

    for segment in &owned {
        registry.release(segment.id());
    }

    println!(
        "{} {} succeeded, {} failed in {:.2?} ({:.0} req/s)",
        style("done:").green().bold(),
        ok,
        failed,
        elapsed,
        (ok + failed) as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    Ok(())
}
