use std::error::Error;

use ferrite_blk::cli::run_cli;

fn main() -> Result<(), Box<dyn Error>> {
    run_cli()
}
