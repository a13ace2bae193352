fn main() {
    // Stamp the binary so `--version` can report when and for what target
    // it was built.
    println!(
        "cargo:rustc-env=CAMGRID_BUILD_TIME={}",
        chrono::Utc::now().to_rfc3339()
    );
    println!(
        "cargo:rustc-env=CAMGRID_BUILD_TARGET={}",
        std::env::var("TARGET").unwrap_or_else(|_| "unknown".into())
    );
}
