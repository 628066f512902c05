use std::io::Read;
use std::net::TcpStream;

// Reads an address from stdin and reports whether it is reachable.
fn main() {
    let mut addr = String::new();
    std::io::stdin().read_to_string(&mut addr).unwrap();
    match TcpStream::connect(addr.trim()) {
        Ok(_) => println!("connected"),
        Err(_) => println!("isolated"),
    }
}
