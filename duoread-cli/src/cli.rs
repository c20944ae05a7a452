use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use duoread_core::{Settings, StreamSettings};

#[derive(Parser, Debug)]
#[command(name = "duoread")]
#[command(about = "Align scanned originals with their translations, page by page")]
pub struct Args {
    /// Data directory (defaults to the platform data dir)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Process original and translated images into an aligned collection
    Align(AlignArgs),
    /// Restore a collection from already processed pages
    Import {
        name: String,
        /// Directory with original pages
        #[arg(long)]
        orig: PathBuf,
        /// Directory with translated pages
        #[arg(long)]
        transl: Option<PathBuf>,
    },
    /// List stored collections
    List,
    /// Delete a collection
    Delete { name: String },
    /// Show the job marker and effective settings
    Status,
}

#[derive(ClapArgs, Debug)]
pub struct AlignArgs {
    /// Collection name
    pub name: String,

    /// Directory with original images
    #[arg(long)]
    pub orig: PathBuf,

    /// Directory with translated images (omit for originals only)
    #[arg(long)]
    pub transl: Option<PathBuf>,

    /// Regex ordering originals by named groups int0, string0, ...
    #[arg(long)]
    pub orig_order: Option<String>,

    /// Regex ordering translations
    #[arg(long)]
    pub transl_order: Option<String>,

    /// Pages original output may run ahead of translation output
    #[arg(long)]
    pub search_range: Option<usize>,

    /// Target pixel area of produced pages (0 keeps full size)
    #[arg(long)]
    pub resize: Option<u32>,

    /// Keep double pages whole
    #[arg(long)]
    pub no_split: bool,

    /// Keep uniform borders
    #[arg(long)]
    pub no_crop: bool,

    /// Left page first when splitting
    #[arg(long)]
    pub left_to_right: bool,

    /// Feature count for translation matching
    #[arg(long)]
    pub orb_count: Option<u32>,

    /// Print raw JSON events
    #[arg(long)]
    pub json: bool,
}

impl AlignArgs {
    /// Settings for this run: file settings with command line overrides.
    pub fn apply(&self, mut settings: Settings) -> Settings {
        if let Some(search_range) = self.search_range {
            settings.search_range = search_range;
        }
        for stream in [&mut settings.orig, &mut settings.transl] {
            self.apply_stream(stream);
        }
        if let Some(orb_count) = self.orb_count {
            settings.transl.orb_count = Some(orb_count);
        }
        settings
    }

    fn apply_stream(&self, stream: &mut StreamSettings) {
        if let Some(resize) = self.resize {
            stream.resize = resize;
        }
        if self.no_split {
            stream.do_split = false;
        }
        if self.no_crop {
            stream.do_crop = false;
        }
        if self.left_to_right {
            stream.right2left = false;
        }
    }
}
