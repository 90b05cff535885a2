use ninep::client::Client;
use ninep::srv::dispatch;
use ninep::vfs::{Node, VfsServer};
use ninep::{serialize, FCall, Msg};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

async fn connected_client(root: Node) -> Client<tokio::io::WriteHalf<tokio::io::DuplexStream>> {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_side);
    let (client_read, client_write) = tokio::io::split(client_side);

    tokio::spawn(async move {
        let _ = dispatch(VfsServer::new(root), server_read, server_write).await;
    });

    Client::connect(client_read, client_write, "tester", "")
        .await
        .expect("attach should succeed")
}

#[tokio::test]
async fn attach_and_stat_root() {
    let root = Node::new_root();
    let client = connected_client(root).await;

    let stat = client.stat("").await.expect("stat of root");
    assert_eq!(stat.name, "");
}

#[tokio::test]
async fn write_then_read_round_trips() {
    let root = Node::new_root();
    root.mk_file("greeting", Vec::new()).unwrap();
    let client = connected_client(root).await;

    {
        use tokio::io::AsyncWriteExt;
        let mut w = client.open_write("greeting").await.unwrap();
        w.write_all(b"hello 9p").await.unwrap();
        w.shutdown().await.unwrap();
    }

    {
        use tokio::io::AsyncReadExt;
        let mut r = client.open_read("greeting").await.unwrap();
        let mut buf = Vec::new();
        r.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello 9p");
    }
}

#[tokio::test]
async fn create_makes_a_new_file() {
    let root = Node::new_root();
    let client = connected_client(root).await;

    {
        use tokio::io::AsyncWriteExt;
        let mut w = client.open_create("", "fresh", 0o644).await.unwrap();
        w.write_all(b"brand new").await.unwrap();
        w.shutdown().await.unwrap();
    }

    let stat = client.stat("fresh").await.unwrap();
    assert_eq!(stat.length, "brand new".len() as u64);
}

#[tokio::test]
async fn walk_missing_first_component_is_enoent() {
    let root = Node::new_root();
    let client = connected_client(root).await;

    let err = client.stat("nowhere/at/all").await.unwrap_err();
    match err {
        ninep::Error::Proto(_, _) => {}
        other => panic!("expected a protocol error, got {:?}", other),
    }
}

#[tokio::test]
async fn walk_missing_later_component_is_enoent() {
    let root = Node::new_root();
    root.mk_directory("etc").unwrap();
    let client = connected_client(root).await;

    let err = client.stat("etc/passwd").await.unwrap_err();
    match err {
        ninep::Error::Proto(_, _) => {}
        other => panic!("expected a protocol error, got {:?}", other),
    }
}

#[tokio::test]
async fn directory_listing_includes_dot_and_dotdot() {
    let root = Node::new_root();
    root.mk_directory("sub").unwrap();
    root.mk_file("f", b"x".to_vec()).unwrap();
    let client = connected_client(root).await;

    let entries = client.list_dir("").await.unwrap();
    let names: Vec<&str> = entries.iter().map(|s| s.name.as_str()).collect();
    assert!(names.contains(&"."));
    assert!(names.contains(&".."));
    assert!(names.contains(&"sub"));
    assert!(names.contains(&"f"));
}

async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) {
    let size = (payload.len() + 4) as u32;
    w.write_all(&size.to_le_bytes()).await.unwrap();
    w.write_all(payload).await.unwrap();
}

async fn read_frame<R: tokio::io::AsyncRead + Unpin>(r: &mut R) -> Vec<u8> {
    let mut size_buf = [0u8; 4];
    r.read_exact(&mut size_buf).await.unwrap();
    let size = u32::from_le_bytes(size_buf) as usize;
    let mut payload = vec![0u8; size - 4];
    r.read_exact(&mut payload).await.unwrap();
    payload
}

/// A `Twalk` whose declared `nwname` count (5) doesn't match the number
/// of name strings actually present in the frame (0) is structurally
/// malformed past the point its tag can be recovered: `decode_msg`
/// should fail, and the dispatcher should still reply `Rerror` tagged
/// with the salvaged tag rather than silently dropping the frame or
/// tearing down the connection.
#[tokio::test]
async fn malformed_body_still_gets_a_tagged_rerror() {
    let root = Node::new_root();
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_side);
    tokio::spawn(async move {
        let _ = dispatch(VfsServer::new(root), server_read, server_write).await;
    });
    let (mut client_read, mut client_write) = tokio::io::split(client_side);

    let tversion = Msg {
        tag: 0xFFFF,
        body: FCall::TVersion {
            msize: 0x2000,
            version: "9P2000.u".to_owned(),
        },
    };
    let mut body = Vec::new();
    serialize::encode_msg(&tversion, &mut body, true).unwrap();
    write_frame(&mut client_write, &body).await;
    let _rversion = read_frame(&mut client_read).await;

    // Hand-rolled Twalk: type(110) tag(7) fid(2) newfid(3) nwname(5), then
    // nothing — no name strings follow despite nwname claiming 5.
    let mut malformed = Vec::new();
    malformed.push(110u8);
    malformed.extend_from_slice(&7u16.to_le_bytes());
    malformed.extend_from_slice(&2u32.to_le_bytes());
    malformed.extend_from_slice(&3u32.to_le_bytes());
    malformed.extend_from_slice(&5u16.to_le_bytes());
    write_frame(&mut client_write, &malformed).await;

    let reply = read_frame(&mut client_read).await;
    let msg = serialize::decode_msg(&mut std::io::Cursor::new(reply), true).unwrap();
    assert_eq!(msg.tag, 7);
    match msg.body {
        FCall::RError { ename, .. } => assert_eq!(ename, "Malformed message."),
        other => panic!("expected Rerror, got {:?}", other),
    }

    // The connection is still alive: a well-formed request after the
    // malformed one gets a normal reply.
    let tstat = Msg {
        tag: 9,
        body: FCall::TStat { fid: 999 },
    };
    let mut body = Vec::new();
    serialize::encode_msg(&tstat, &mut body, true).unwrap();
    write_frame(&mut client_write, &body).await;
    let reply = read_frame(&mut client_read).await;
    let msg = serialize::decode_msg(&mut std::io::Cursor::new(reply), true).unwrap();
    assert_eq!(msg.tag, 9);
    assert!(matches!(msg.body, FCall::RError { .. }));
}

#[tokio::test]
async fn remove_deletes_the_node() {
    let root = Node::new_root();
    root.mk_file("doomed", Vec::new()).unwrap();
    let client = connected_client(root).await;

    client.remove("doomed").await.unwrap();
    let err = client.stat("doomed").await.unwrap_err();
    match err {
        ninep::Error::Proto(_, _) => {}
        other => panic!("expected a protocol error, got {:?}", other),
    }
}
