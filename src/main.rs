use warden::cli::{self, Cli};

fn main() {
    match Cli::run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            cli::report_error(&e);
            std::process::exit(e.exit_code());
        }
    }
}
