use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "tab-groups")]
#[command(version, about = "Named, persistent tab groups stored as bookmark folders", long_about = None)]
pub struct Args {
    /// Directory holding the bookmark tree and secondary stores
    #[arg(short, long, global = true, env = "TAB_GROUPS_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List all groups
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create an empty group
    Create {
        /// Group name, optionally prefixed with a color glyph
        name: String,
    },

    /// Delete a group and its saved tabs
    Delete {
        /// Group ID
        id: String,
    },

    /// Set or clear a group's color
    Color {
        /// Group ID
        id: String,

        /// red, orange, yellow, green, blue or purple; omit to clear
        color: Option<String>,
    },

    /// Remove favicons and tab info no saved tab refers to
    Prune,

    /// Show version information
    Version,
}
