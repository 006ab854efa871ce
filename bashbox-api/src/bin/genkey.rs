//! Prints a fresh signing keypair in env-file form.

fn main() {
    let (public, private) = bashbox_auth::gen_keypair();
    println!("PUBLIC={public}");
    println!("PRIVATE={private}");
}
