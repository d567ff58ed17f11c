use std::process::ExitCode;

fn main() -> ExitCode {
    itinera_cli::run()
}
