fn main() {
    if let Err(err) = submission_migrate::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
