//! `dental-label-merge` command-line tool
//!
//! Merges the inferior/superior segmentations of one subject into
//! `labels_mapped.nii.gz`.

use std::path::PathBuf;
use std::process;

use anyhow::{Context, bail};
use clap::{ArgAction, Parser, ValueEnum};
use dental_label_merge::{
    OverlapPolicy, PathResolver, PipelineConfig, ResolverConfig, SubjectPipeline, VolumeIo,
    VolumeLoader,
};

#[derive(Parser)]
#[command(name = "dental-label-merge")]
#[command(about = "Remap and merge inf/sup dental segmentations of one subject", version)]
struct Cli {
    /// Folder holding the inf/sup segmentations and json mappings:
    /// "<subject>", "<subject>/labels" or "<subject>/labels/<rater>"
    #[arg(required_unless_present = "volumes")]
    folder: Option<PathBuf>,

    /// Canonical codes to drop from the output, e.g. --skip 1 2 3
    #[arg(long, num_args = 1.., action = ArgAction::Append)]
    skip: Vec<u16>,

    /// Output file path (default: labels_mapped.nii.gz next to the first segmentation)
    #[arg(short = 'o', long = "out-file", alias = "out_file")]
    out_file: Option<PathBuf>,

    /// Rater folder to read instead of the first available one
    #[arg(long)]
    rater: Option<String>,

    /// Segmentations to merge, bypassing folder discovery
    #[arg(long, num_args = 1.., conflicts_with = "folder", requires = "mappings")]
    volumes: Vec<PathBuf>,

    /// Mappings for --volumes, paired by the inf/sup tag in their names
    #[arg(long, num_args = 1.., requires = "volumes")]
    mappings: Vec<PathBuf>,

    /// What to do when both regions label the same voxel
    #[arg(long, value_enum, default_value_t = OnOverlap::PreferFirst)]
    on_overlap: OnOverlap,

    /// Write a mask of overlapping voxels here when --on-overlap=abort trips
    #[arg(long)]
    overlap_mask: Option<PathBuf>,

    /// Fail on canonical codes outside 1-3 and 11-48
    #[arg(long)]
    strict_taxonomy: bool,

    /// Don't replace an existing output file
    #[arg(long)]
    no_overwrite: bool,

    /// Canonical codes to rewrite into --collapse-into after merging
    #[arg(long, num_args = 1.., requires = "collapse_into")]
    collapse: Vec<u16>,

    /// Code the --collapse codes become
    #[arg(long, requires = "collapse")]
    collapse_into: Option<u16>,
}

#[derive(Clone, Copy, ValueEnum)]
enum OnOverlap {
    /// Keep the inferior labels and warn
    PreferFirst,
    /// Stop with an error
    Abort,
}

impl From<OnOverlap> for OverlapPolicy {
    fn from(value: OnOverlap) -> Self {
        match value {
            OnOverlap::PreferFirst => OverlapPolicy::PreferFirst,
            OnOverlap::Abort => OverlapPolicy::Abort,
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        eprintln!("Error: {err:#}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut resolver_config = ResolverConfig::default();
    if let Some(rater) = cli.rater {
        resolver_config = resolver_config.with_rater(rater);
    }
    let resolver = PathResolver::new(resolver_config);

    let pairs = match &cli.folder {
        Some(folder) => resolver.resolve(folder)?,
        None => resolver
            .pair_files(&cli.volumes, &cli.mappings)
            .context("pairing --volumes with --mappings")?,
    };

    let mut config = PipelineConfig::default()
        .with_overlap_policy(cli.on_overlap.into())
        .with_strict_taxonomy(cli.strict_taxonomy);
    if !cli.skip.is_empty() {
        config = config.with_skip(cli.skip);
    }
    if let Some(path) = cli.overlap_mask {
        config = config.with_overlap_mask(path);
    }
    if let Some(into) = cli.collapse_into {
        config = config.with_collapse(cli.collapse, into);
    }

    let loader = VolumeLoader::new().with_overwrite(!cli.no_overwrite);
    let merged = SubjectPipeline::new(&loader, config).run(&pairs)?;

    let out_file = match cli.out_file {
        Some(path) => path,
        None => match merged.default_output_path() {
            Some(path) => path,
            None => bail!("no output path could be derived from the inputs"),
        },
    };
    loader
        .save(&merged.volume, &out_file)
        .with_context(|| format!("writing {}", out_file.display()))?;

    log::info!(
        "Wrote {} for subject {} ({} warning(s))",
        out_file.display(),
        merged.subject,
        merged.warnings.len()
    );
    Ok(())
}
