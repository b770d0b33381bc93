fn main() {
    // Embedded migrations (sqlx::migrate!) must be re-read when a file is added
    println!("cargo:rerun-if-changed=migrations");
}
