use std::process::ExitCode;

use nbjit::{new_session, read_program};

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let path = match args.next() {
        Some(path) => path,
        None => {
            eprintln!("usage: nbjit <file>");
            return ExitCode::FAILURE;
        }
    };

    let source = match std::fs::read_to_string(&path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("cannot read {}: {}", path, e);
            return ExitCode::FAILURE;
        }
    };

    let ast = match read_program(&source) {
        Ok(ast) => ast,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut session = new_session();
    match session.run_cell(&ast, &path) {
        Ok(result) => {
            println!("result      = {}", result.value);
            println!("class       = {}", result.class);
            println!("main built  = {}", result.main_rebuilt);
            if !result.recompiled_holes.is_empty() {
                let holes: Vec<String> = result
                    .recompiled_holes
                    .iter()
                    .map(|o| o.to_string())
                    .collect();
                println!("holes built = [{}]", holes.join(", "));
            }
            session.cleanup_session();
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            session.cleanup_session();
            ExitCode::FAILURE
        }
    }
}
