use std::process::ExitCode;

fn main() -> ExitCode {
    match tandem::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error[{}]: {}", err.kind(), err);
            ExitCode::FAILURE
        }
    }
}
