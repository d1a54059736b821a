//! Add build information.
#![allow(clippy::expect_used)]

use std::error::Error;

use vergen::EmitBuilder;

fn main() -> Result<(), Box<dyn Error>> {
	// Lenient emit: builds from release tarballs have no git metadata
	EmitBuilder::builder().all_build().all_git().git_sha(false).emit()?;
	Ok(())
}
