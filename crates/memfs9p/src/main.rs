use clap::Parser;
use ninep::{
    srv::srv_async,
    vfs::{Node, VfsServer},
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    address: String,

    /// Contents of the /motd file published at the tree root.
    #[arg(long, default_value = "welcome to memfs9p\n")]
    motd: String,

    /// Also publish a small demo tree (docs/ directory with a readme
    /// and a symlink back to /motd) alongside /motd.
    #[arg(long)]
    seed_demo: bool,
}

fn build_tree(cli: &Cli) -> ninep::Result<Node> {
    let root = Node::new_root();
    root.mk_file("motd", cli.motd.clone().into_bytes())?;

    if cli.seed_demo {
        let docs = root.mk_directory("docs")?;
        docs.mk_file("readme", b"this tree is served from memory\n".to_vec())?;
        root.mk_symlink("motd-link", "motd")?;

        // A synthetic file whose contents are generated per read rather
        // than stored: each Tread gets the current request count as a
        // decimal line, demonstrating the on_read hook from vfs::Node.
        let reqs = root.mk_file("requests", Vec::new())?;
        let count = Arc::new(AtomicU64::new(0));
        reqs.set_read_hook(Arc::new(move |_data, offset, count_bytes| {
            let n = count.fetch_add(1, Ordering::SeqCst) + 1;
            let line = format!("{}\n", n).into_bytes();
            let end = std::cmp::min(line.len(), offset as usize + count_bytes as usize);
            Ok(line.get(offset as usize..end).unwrap_or(&[]).to_vec())
        }));
    }

    Ok(root)
}

async fn memfs9p_main(cli: Cli) -> ninep::Result<i32> {
    let root = build_tree(&cli)?;

    println!("[*] Ready to accept clients: {}", cli.address);
    srv_async(VfsServer::new(root), &cli.address)
        .await
        .and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = memfs9p_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_tree_has_expected_entries() {
        let cli = Cli {
            address: "tcp!127.0.0.1!0".to_owned(),
            motd: "hi\n".to_owned(),
            seed_demo: true,
        };
        let root = build_tree(&cli).unwrap();
        assert!(root.child("motd").is_some());
        assert!(root.child("docs").is_some());
        assert!(root.child("motd-link").is_some());
        assert!(root.child("docs").unwrap().child("readme").is_some());
        assert!(root.child("requests").is_some());
    }

    #[test]
    fn bare_tree_only_has_motd() {
        let cli = Cli {
            address: "tcp!127.0.0.1!0".to_owned(),
            motd: "hi\n".to_owned(),
            seed_demo: false,
        };
        let root = build_tree(&cli).unwrap();
        assert!(root.child("motd").is_some());
        assert!(root.child("docs").is_none());
    }
}
