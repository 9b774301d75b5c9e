// tests/integration/pipeline_test.rs

//! Shard pipeline RPCs over real connections. The media tool is absent, so
//! these scenarios exercise ingestion, bookkeeping and the failure paths.

use super::test_helpers::{connect, spawn_node, wait_for};
use parking_lot::Mutex;
use prismd::core::cluster::NodeRole;
use prismd::core::media::Container;
use prismd::core::pipeline::job::{ShardState, ShardStatus, VideoJob};
use prismd::core::pipeline::worker;
use prismd::core::protocol::{
    DistributeShardRequest, RpcRequest, RpcResponse, UploadVideoChunk,
};
use std::sync::Arc;
use std::time::Duration;

const RPC_DEADLINE: Duration = Duration::from_secs(5);
const UPLOAD_DEADLINE: Duration = Duration::from_secs(30);

fn upload_chunks(video_id: &str) -> Vec<UploadVideoChunk> {
    vec![
        UploadVideoChunk {
            video_id: video_id.to_string(),
            data_chunk: vec![1u8; 4096],
            target_width: 640,
            target_height: 480,
            upscale_width: 1280,
            upscale_height: 720,
            output_format: "mp4".to_string(),
            original_filename: "clip.mp4".to_string(),
            is_first_chunk: true,
        },
        UploadVideoChunk {
            video_id: video_id.to_string(),
            data_chunk: vec![2u8; 4096],
            ..Default::default()
        },
    ]
}

#[tokio::test]
async fn test_upload_on_worker_is_rejected() {
    let (handle, _dir) = spawn_node(NodeRole::Worker, Some("127.0.0.1:9".to_string())).await;
    let mut client = connect(&handle.address).await;

    let (_, success, message) = client
        .upload_video(upload_chunks("vid-rejected"), UPLOAD_DEADLINE)
        .await
        .unwrap();
    assert!(!success);
    assert!(message.contains("not the master"));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_upload_without_media_tool_fails_segmentation() {
    let (handle, dir) = spawn_node(NodeRole::Master, None).await;
    let mut client = connect(&handle.address).await;

    let (video_id, success, message) = client
        .upload_video(upload_chunks("vid-seg-fail"), UPLOAD_DEADLINE)
        .await
        .unwrap();
    assert_eq!(video_id, "vid-seg-fail");
    assert!(!success);
    assert!(message.contains("Segmentation failed"));

    // The original landed on disk before the tool ran.
    assert!(
        dir.path()
            .join("master_data")
            .join("vid-seg-fail_original.tmp")
            .exists()
    );

    let mut client = connect(&handle.address).await;
    match client
        .call(
            RpcRequest::GetVideoStatus {
                video_id: "vid-seg-fail".to_string(),
            },
            RPC_DEADLINE,
        )
        .await
        .unwrap()
    {
        RpcResponse::VideoStatus { status, .. } => assert_eq!(status, "failed_segmentation"),
        other => panic!("unexpected reply: {}", other.kind()),
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn test_video_status_not_found_and_not_master() {
    let (master, _dir) = spawn_node(NodeRole::Master, None).await;
    let mut client = connect(&master.address).await;
    match client
        .call(
            RpcRequest::GetVideoStatus {
                video_id: "nope".to_string(),
            },
            RPC_DEADLINE,
        )
        .await
        .unwrap()
    {
        RpcResponse::VideoStatus { status, .. } => assert_eq!(status, "not_found"),
        other => panic!("unexpected reply: {}", other.kind()),
    }
    master.shutdown().await;

    let (worker, _dir) = spawn_node(NodeRole::Worker, Some("127.0.0.1:9".to_string())).await;
    let mut client = connect(&worker.address).await;
    match client
        .call(
            RpcRequest::GetVideoStatus {
                video_id: "nope".to_string(),
            },
            RPC_DEADLINE,
        )
        .await
        .unwrap()
    {
        RpcResponse::VideoStatus { status, .. } => assert_eq!(status, "not_master"),
        other => panic!("unexpected reply: {}", other.kind()),
    }
    worker.shutdown().await;
}

#[tokio::test]
async fn test_retrieve_incomplete_video_is_rejected() {
    let (handle, _dir) = spawn_node(NodeRole::Master, None).await;
    let mut client = connect(&handle.address).await;
    let _ = client
        .upload_video(upload_chunks("vid-ret"), UPLOAD_DEADLINE)
        .await
        .unwrap();

    let mut client = connect(&handle.address).await;
    let err = client
        .retrieve_video("vid-ret", RPC_DEADLINE)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Not yet completed"));

    let mut client = connect(&handle.address).await;
    let err = client
        .retrieve_video("vid-unknown", RPC_DEADLINE)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Video not found"));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_process_shard_accepts_then_reports_failure_into_buffer() {
    let (handle, _dir) = spawn_node(NodeRole::Worker, Some("127.0.0.1:9".to_string())).await;
    let mut client = connect(&handle.address).await;

    let request = RpcRequest::ProcessShard(DistributeShardRequest {
        video_id: "vid-ps".to_string(),
        shard_id: "vid-ps_shard_0000.mp4".to_string(),
        shard_data: vec![3u8; 2048],
        shard_index: 0,
        total_shards: 1,
        target_width: 640,
        target_height: 480,
        original_filename: "clip.mp4".to_string(),
    });
    match client.call(request, RPC_DEADLINE).await.unwrap() {
        RpcResponse::ShardAccepted {
            shard_id, success, ..
        } => {
            assert!(success);
            assert_eq!(shard_id, "vid-ps_shard_0000.mp4");
        }
        other => panic!("unexpected reply: {}", other.kind()),
    }

    // Processing fails (no media tool) and the report cannot reach a master,
    // so the failure lands in the unreported buffer.
    let state = handle.state.clone();
    let buffered = wait_for(Duration::from_secs(10), || {
        state
            .unreported_shards
            .lock()
            .get(&("vid-ps".to_string(), "vid-ps_shard_0000.mp4".to_string()))
            == Some(&ShardStatus::FailedProcessing)
    })
    .await;
    assert!(buffered, "processing failure never buffered");

    // No processed output exists for this shard.
    let mut client = connect(&handle.address).await;
    match client
        .call(
            RpcRequest::RequestShard {
                shard_id: "vid-ps_shard_0000.mp4".to_string(),
            },
            RPC_DEADLINE,
        )
        .await
        .unwrap()
    {
        RpcResponse::Shard {
            success, message, ..
        } => {
            assert!(!success);
            assert!(message.contains("not found"));
        }
        other => panic!("unexpected reply: {}", other.kind()),
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn test_process_shard_rejected_on_master() {
    let (handle, _dir) = spawn_node(NodeRole::Master, None).await;
    let mut client = connect(&handle.address).await;

    let request = RpcRequest::ProcessShard(DistributeShardRequest {
        video_id: "vid-x".to_string(),
        shard_id: "vid-x_shard_0000.mp4".to_string(),
        shard_data: vec![0u8; 16],
        shard_index: 0,
        total_shards: 1,
        target_width: 640,
        target_height: 480,
        original_filename: "clip.mp4".to_string(),
    });
    match client.call(request, RPC_DEADLINE).await.unwrap() {
        RpcResponse::ShardAccepted {
            success, message, ..
        } => {
            assert!(!success);
            assert!(message.contains("Not a worker"));
        }
        other => panic!("unexpected reply: {}", other.kind()),
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn test_unreported_shards_drain_to_new_master() {
    let (master, _master_dir) = spawn_node(NodeRole::Master, None).await;
    let (worker_node, _worker_dir) =
        spawn_node(NodeRole::Worker, Some("127.0.0.1:9".to_string())).await;

    // The master tracks a job whose shard was handed to the worker.
    let mut job = VideoJob::new(
        "vid-drain".to_string(),
        Container::Mp4,
        640,
        480,
        1280,
        720,
        "clip.mp4".to_string(),
    );
    job.total_shards = 1;
    job.shards.insert(
        "vid-drain_shard_0000.mp4".to_string(),
        ShardState {
            status: ShardStatus::SentToWorker,
            worker_address: worker_node.address.clone(),
            index: 0,
            message: String::new(),
        },
    );
    master
        .state
        .jobs
        .insert("vid-drain".to_string(), Arc::new(Mutex::new(job)));

    // The worker processed the shard but could not report it to anyone.
    worker::report_shard_status(
        &worker_node.state,
        "vid-drain",
        "vid-drain_shard_0000.mp4",
        ShardStatus::ProcessedSuccessfully,
    )
    .await;
    assert_eq!(worker_node.state.unreported_shards.lock().len(), 1);

    // A master announcement arrives; the worker drains its buffer to it.
    let mut client = connect(&worker_node.address).await;
    match client
        .call(
            RpcRequest::AnnounceMaster {
                master_address: master.address.clone(),
                backup_master_address: String::new(),
                node_id_of_master: master.state.node_id.clone(),
                term: 1,
            },
            RPC_DEADLINE,
        )
        .await
        .unwrap()
    {
        RpcResponse::Announce { status, .. } => assert!(status.contains("Acknowledged")),
        other => panic!("unexpected reply: {}", other.kind()),
    }

    let worker_state = worker_node.state.clone();
    let drained = wait_for(Duration::from_secs(10), || {
        worker_state.unreported_shards.lock().is_empty()
    })
    .await;
    assert!(drained, "buffer never drained after master change");

    // The master saw the report; retrieval then failed because the worker has
    // no processed file to serve.
    let master_state = master.state.clone();
    let settled = wait_for(Duration::from_secs(10), || {
        let Some(job_arc) = master_state
            .jobs
            .get("vid-drain")
            .map(|entry| entry.value().clone())
        else {
            return false;
        };
        let job = job_arc.lock();
        matches!(
            job.shards["vid-drain_shard_0000.mp4"].status,
            ShardStatus::RetrievalFailed | ShardStatus::RetrievalRpcFailed
        )
    })
    .await;
    assert!(settled, "master never applied the drained report");

    worker_node.shutdown().await;
    master.shutdown().await;
}
