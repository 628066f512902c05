use std::io::Write;

fn main() {
    let buffer = vec![b'a'; 2 * 1024 * 1024];
    let mut stderr = std::io::stderr();
    stderr.write_all(&buffer).unwrap();
    stderr.flush().unwrap();
    std::process::exit(1);
}
