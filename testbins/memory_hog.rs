use std::io::Read;

// Commits the number of MiB given on stdin, then holds it for a while.
fn main() {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input).unwrap();
    let mib: usize = input.trim().parse().unwrap();

    let mut blocks = Vec::new();
    for _ in 0..mib {
        let mut block = vec![0u8; 1024 * 1024];
        for page in block.chunks_mut(4096) {
            page[0] = 1;
        }
        blocks.push(std::hint::black_box(block));
    }
    std::thread::sleep(std::time::Duration::from_secs(2));
    println!("{}", blocks.len());
}
