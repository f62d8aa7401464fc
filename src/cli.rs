use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "storyforge",
    version,
    about = "Call the storyforge generation gateway from the command line"
)]
pub struct Cli {
    /// YAML config file (defaults to ./storyforge.yaml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate text with model fallback
    Text {
        /// System prompt, or @path to read it from a file
        #[arg(long, default_value = "")]
        system: String,
        /// User prompt, or @path to read it from a file
        user: String,
        #[arg(long, default_value_t = false)]
        json: bool,
        /// Print text as it is generated
        #[arg(long, default_value_t = false, conflicts_with = "json")]
        stream: bool,
        #[arg(long)]
        model: Option<String>,
        /// Fallback model; pass an empty string to disable
        #[arg(long)]
        fallback: Option<String>,
        /// Timeout in seconds
        #[arg(long)]
        timeout: Option<f64>,
        #[arg(long)]
        temperature: Option<f64>,
        #[arg(long)]
        top_p: Option<f64>,
        #[arg(long)]
        top_k: Option<i64>,
        #[arg(long)]
        max_output_tokens: Option<i64>,
    },
    /// Generate an image and print its data URL
    Image {
        prompt: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        timeout: Option<f64>,
        /// Write decoded image bytes here instead of printing the data URL
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
    },
    /// List the models callers may request
    Models,
}
