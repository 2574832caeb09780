//! Chunked blob transfer on a dedicated listener.
//!
//! A connection is either an upload (client streams [`FileChunk`]s, server
//! answers with one [`FileReceipt`]) or a download (client sends one
//! [`FileRequest`], server streams chunks back). The first frame decides
//! which. Files land at `<root>/<file_id>`; ids must be a single path
//! component.

use std::path::{Path, PathBuf};

use futures::{SinkExt, StreamExt};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use crate::error::HubResult;
use crate::wire::codec::FileCodec;
use crate::wire::files::{
    DEFAULT_CHUNK_SIZE, FileChunk, FileFrame, FileReceipt, FileRequest,
};

pub struct FileServer {
    listener: TcpListener,
    root: PathBuf,
}

type FileStream = Framed<TcpStream, FileCodec>;

impl FileServer {
    pub async fn bind(addr: &str, root: impl Into<PathBuf>) -> HubResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, root })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> HubResult<()> {
        tracing::info!(addr = %self.local_addr()?, root = %self.root.display(), "File listener up");
        loop {
            let (socket, peer) = self.listener.accept().await?;
            let root = self.root.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_transfer(socket, &root).await {
                    tracing::warn!(%peer, %err, "File transfer failed");
                }
            });
        }
    }
}

async fn handle_transfer(socket: TcpStream, root: &Path) -> HubResult<()> {
    let mut stream = Framed::new(socket, FileCodec::new());

    match stream.next().await {
        Some(Ok(FileFrame::Chunk(chunk))) => {
            receive_upload(&mut stream, root, chunk).await
        }
        Some(Ok(FileFrame::Get(request))) => {
            serve_download(&mut stream, root, request).await
        }
        Some(Ok(FileFrame::Receipt(_))) => {
            tracing::debug!("Peer opened with a receipt; closing");
            Ok(())
        }
        Some(Err(err)) => Err(err),
        // Closed before any frame: still answer with a failed receipt.
        None => {
            stream
                .send(FileFrame::Receipt(FileReceipt::failed(
                    "",
                    "no frames received",
                    0,
                )))
                .await?;
            Ok(())
        }
    }
}

/// A file id is an opaque single path component; anything that could walk
/// the tree is refused.
fn resolve_path(root: &Path, file_id: &str) -> Option<PathBuf> {
    if file_id.is_empty()
        || file_id.contains(['/', '\\'])
        || file_id == "."
        || file_id == ".."
    {
        return None;
    }
    Some(root.join(file_id))
}

async fn receive_upload(
    stream: &mut FileStream,
    root: &Path,
    first: FileChunk,
) -> HubResult<()> {
    let file_id = first.file_id.clone();
    let Some(path) = resolve_path(root, &file_id) else {
        stream
            .send(FileFrame::Receipt(FileReceipt::failed(
                &file_id,
                "invalid file id",
                0,
            )))
            .await?;
        return Ok(());
    };

    let mut file = fs::File::create(&path).await?;
    let mut written: u64 = 0;
    let mut chunk = first;
    let receipt = loop {
        file.write_all(&chunk.data).await?;
        written += chunk.data.len() as u64;
        if chunk.is_last {
            file.flush().await?;
            tracing::info!(%file_id, size = written, "File stored");
            break FileReceipt::ok(&file_id, written);
        }
        chunk = match stream.next().await {
            Some(Ok(FileFrame::Chunk(chunk))) => chunk,
            Some(Ok(_)) => {
                break FileReceipt::failed(
                    &file_id,
                    "unexpected frame mid-upload",
                    written,
                );
            }
            Some(Err(err)) => return Err(err),
            None => {
                break FileReceipt::failed(
                    &file_id,
                    "stream ended before final chunk",
                    written,
                );
            }
        };
    };

    stream.send(FileFrame::Receipt(receipt)).await?;
    Ok(())
}

async fn serve_download(
    stream: &mut FileStream,
    root: &Path,
    request: FileRequest,
) -> HubResult<()> {
    let file_id = request.file_id.clone();
    let path = match resolve_path(root, &file_id) {
        Some(path) if fs::try_exists(&path).await.unwrap_or(false) => path,
        _ => {
            stream
                .send(FileFrame::Receipt(FileReceipt::failed(
                    &file_id,
                    "no such file",
                    0,
                )))
                .await?;
            return Ok(());
        }
    };

    let mut file = fs::File::open(&path).await?;
    let total_size = file.metadata().await?.len();
    let mut offset = request.offset.min(total_size);
    file.seek(std::io::SeekFrom::Start(offset)).await?;

    let chunk_size = if request.chunk_size == 0 {
        DEFAULT_CHUNK_SIZE as usize
    } else {
        request.chunk_size as usize
    };

    let mut buf = vec![0u8; chunk_size];
    loop {
        let read = file.read(&mut buf).await?;
        // read == 0 covers a file truncated while serving it
        let is_last = read == 0 || offset + read as u64 >= total_size;
        stream
            .send(FileFrame::Chunk(FileChunk {
                file_id: file_id.clone(),
                data: buf[..read].to_vec(),
                offset,
                total_size,
                is_last,
                metadata: Default::default(),
            }))
            .await?;
        offset += read as u64;
        if is_last {
            break;
        }
    }
    tracing::debug!(%file_id, total_size, "File served");
    Ok(())
}
