use anyhow::Result;
use futures::stream::TryStreamExt;

use super::*;
use crate::config::Config;
use crate::database::Database;
use crate::models::{AccessMode, ChannelInfo};

fn channel(name: &str) -> ChannelInfo {
    ChannelInfo {
        name: name.into(),
        term: 2,
        access_mode: AccessMode::ReadWrite,
    }
}

async fn read_ids(wal: &SledWal, opt: ReadOption) -> Result<Vec<MessageId>> {
    let messages: Vec<Message> = wal.read(opt).await?.try_collect().await?;
    Ok(messages.into_iter().map(|msg| msg.id).collect())
}

#[tokio::test]
async fn append_assigns_sequential_ids() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config).await?;
    let wal = SledWal::open(&db, channel("c1")).await?;

    let mut ids = vec![];
    for idx in 0..5u8 {
        ids.push(wal.append(vec![idx]).await?);
    }

    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    let messages: Vec<Message> = wal.read(ReadOption::All).await?.try_collect().await?;
    assert_eq!(messages[2], Message { id: 3, payload: vec![2] });
    Ok(())
}

#[tokio::test]
async fn read_honors_start_position() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config).await?;
    let wal = SledWal::open(&db, channel("c1")).await?;
    for idx in 0..300u16 {
        wal.append(idx.to_be_bytes().to_vec()).await?;
    }

    // IDs past 255 exercise the big-endian key ordering.
    assert_eq!(read_ids(&wal, ReadOption::StartFrom(255)).await?[..3], [255, 256, 257]);
    assert_eq!(read_ids(&wal, ReadOption::StartAfter(255)).await?[0], 256);
    assert_eq!(read_ids(&wal, ReadOption::All).await?.len(), 300);
    assert!(read_ids(&wal, ReadOption::StartAfter(300)).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn truncate_discards_messages_up_to_id() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config).await?;
    let wal = SledWal::open(&db, channel("c1")).await?;
    for idx in 0..5u8 {
        wal.append(vec![idx]).await?;
    }

    wal.truncate(3).await?;

    assert_eq!(read_ids(&wal, ReadOption::All).await?, vec![4, 5]);
    assert_eq!(wal.append(vec![9]).await?, 6, "expected truncation to keep the id sequence");
    Ok(())
}

#[tokio::test]
async fn reopen_recovers_last_written_id() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config).await?;
    let wal = SledWal::open(&db, channel("c1")).await?;
    wal.append(vec![1]).await?;
    wal.append(vec![2]).await?;
    wal.close().await?;

    let reopened = SledWal::open(&db, channel("c1")).await?;
    let other = SledWal::open(&db, channel("c2")).await?;

    assert_eq!(reopened.append(vec![3]).await?, 3);
    assert_eq!(other.append(vec![1]).await?, 1, "expected channels to have independent wals");
    Ok(())
}

#[tokio::test]
async fn closed_wal_rejects_operations() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config).await?;
    let wal = SledWal::open(&db, channel("c1")).await?;

    wal.close().await?;
    wal.close().await?;

    assert!(wal.append(vec![1]).await.is_err(), "expected append on a closed wal to fail");
    assert!(wal.read(ReadOption::All).await.is_err(), "expected read on a closed wal to fail");
    Ok(())
}
