//! Build script for device library linkage.
//!
//! Host-only builds need nothing from the CUDA toolkit. With the `cuda`
//! feature enabled, adds the toolkit library directories to the linker search
//! path so `libcuda`, `libcublas`, `libcurand` (and `libcudnn` with the
//! `cudnn` feature) resolve.
//!
//! # Environment Variables
//!
//! - `CUDA_PATH`: Path to CUDA toolkit (auto-detected if not set)

#[cfg(feature = "cuda")]
use std::env;
#[cfg(feature = "cuda")]
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=CUDA_PATH");

    #[cfg(feature = "cuda")]
    {
        add_cuda_search_paths();
    }
}

#[cfg(feature = "cuda")]
fn add_cuda_search_paths() {
    if let Ok(cuda_path) = env::var("CUDA_PATH") {
        for sub in ["lib64", "lib", "lib/x64"] {
            let dir = PathBuf::from(&cuda_path).join(sub);
            if dir.exists() {
                println!("cargo:rustc-link-search=native={}", dir.display());
            }
        }
        return;
    }

    // Common CUDA library paths
    for path in &[
        "/usr/local/cuda/lib64",
        "/usr/local/cuda/lib",
        "/opt/cuda/lib64",
        "/usr/lib/x86_64-linux-gnu",
    ] {
        if PathBuf::from(path).exists() {
            println!("cargo:rustc-link-search=native={}", path);
        }
    }
}
