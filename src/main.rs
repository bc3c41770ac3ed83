use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use ibootpatchfinder::{config::CmdHandlerSpec, image::ByteImage, meta::Meta, run_job, PatchJob};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parses an iBoot image and prints its version/stage/chip-id metadata
    Info {
        /// The iBoot image to inspect
        image: PathBuf,
    },
    /// Runs every transformation enabled in a job file against an image
    Patch {
        /// TOML job file describing which transformations to run
        job: PathBuf,
        /// Print the resulting patches instead of writing an output file
        #[clap(long)]
        list: bool,
    },
    /// Runs a single named transformation and writes the patched image
    Quick {
        /// The iBoot image to patch
        image: PathBuf,
        /// Output path; defaults to `<image>.patched`
        #[clap(short, long)]
        out: Option<PathBuf>,
        /// Replace the default boot-args string
        #[clap(long)]
        boot_args: Option<String>,
        #[clap(long)]
        debug_enabled: bool,
        #[clap(long)]
        sigcheck: bool,
        #[clap(long)]
        demotion: bool,
        #[clap(long)]
        unlock_nvram: bool,
        #[clap(long)]
        nvram_nosave: bool,
        #[clap(long)]
        nvram_noremove: bool,
        #[clap(long)]
        freshnonce: bool,
        #[clap(long)]
        bgcolor_memcpy: bool,
        #[clap(long)]
        ra1nra1n: bool,
        /// Redirect a console command's handler, as `name:0xpointer`
        #[clap(long, value_parser = parse_cmd_handler)]
        cmd_handler: Vec<CmdHandlerSpec>,
    },
}

fn parse_cmd_handler(s: &str) -> Result<CmdHandlerSpec, String> {
    let (cmd, ptr) = s.split_once(':').ok_or_else(|| format!("expected name:0xpointer, got {s:?}"))?;
    let ptr = u64::from_str_radix(ptr.trim_start_matches("0x"), 16).map_err(|e| e.to_string())?;
    Ok(CmdHandlerSpec { cmd: cmd.to_string(), ptr })
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();

    match args.command {
        Commands::Info { image } => {
            let image = ByteImage::open(&image)?;
            let meta = Meta::parse(&image)?;
            println!("{meta:#?}");
        }
        Commands::Patch { job, list } => {
            let job = PatchJob::load(&job)?;
            let image = ByteImage::open(job.image.as_ref())?;
            let meta = Meta::parse(&image)?;
            let patches = run_job(&image, &meta, &job)?;

            if list {
                for patch in &patches {
                    println!("0x{:016x}: {}", patch.va, hex::encode(&patch.bytes));
                }
            } else {
                let out = image.apply(&patches)?;
                fs::write(job.output_path(), out)?;
            }
        }
        Commands::Quick { image: image_path, out, boot_args, debug_enabled, sigcheck, demotion, unlock_nvram, nvram_nosave, nvram_noremove, freshnonce, bgcolor_memcpy, ra1nra1n, cmd_handler } => {
            let job = PatchJob {
                image: image_path.to_string_lossy().into_owned(),
                out: out.map(|p| p.to_string_lossy().into_owned()),
                boot_args,
                debug_enabled,
                sigcheck,
                demotion,
                unlock_nvram,
                nvram_nosave,
                nvram_noremove,
                freshnonce,
                bgcolor_memcpy,
                ra1nra1n,
                cmd_handlers: cmd_handler,
            };
            let image = ByteImage::open(&image_path)?;
            let meta = Meta::parse(&image)?;
            let patches = run_job(&image, &meta, &job)?;
            let out = image.apply(&patches)?;
            fs::write(job.output_path(), out)?;
        }
    }

    Ok(())
}
