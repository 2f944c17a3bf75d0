//! End-to-end scoring against a tiny synthetic checkpoint written to a temp
//! directory. No network access or GPU is required; the remote-image cases
//! talk to a local listener.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread::JoinHandle;

use candle_core::{DType, Device};
use llava_reward_core::{
    evaluate, evaluate_with,
    loader::{load_pretrained_model, LoadRequest},
    models::{ForwardOptions, ModelRegistry, TransferMode},
    multimodal::{load_image, ImageAcquisitionError, MultimodalInputs},
    testing::write_tiny_checkpoint,
    EvaluateError, EvaluateRequest,
};

/// Serve exactly one request with `status_line` and an empty body.
fn serve_once(status_line: &'static str) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let handle = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut chunk).expect("read request");
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let response =
            format!("{status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        stream.write_all(response.as_bytes()).expect("write response");
    });
    (format!("http://{addr}/image.png"), handle)
}

// ─── Scenario A ──────────────────────────────────────────────────────────────

#[test]
fn local_image_scores_finite_reward() {
    let dir = tempfile::tempdir().unwrap();
    let ckpt = write_tiny_checkpoint(dir.path()).unwrap();

    let reward = evaluate(
        ckpt.model_dir.to_str().unwrap(),
        ckpt.image_path.to_str().unwrap(),
        "What is in this image?",
        &Device::Cpu,
    )
    .unwrap();
    assert!(reward.is_finite(), "reward {reward} is not finite");
}

#[test]
fn repeated_forward_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let ckpt = write_tiny_checkpoint(dir.path()).unwrap();
    let request = LoadRequest::new(ckpt.model_dir.to_str().unwrap(), &Device::Cpu, DType::F32);
    let loaded = load_pretrained_model(&request, &ModelRegistry::builtin()).unwrap();
    let (model, _) = loaded.model.into_reward(TransferMode::Lenient).unwrap();

    let img = load_image(ckpt.image_path.to_str().unwrap()).unwrap();
    let pixels = loaded
        .image_processor
        .process_images(&[img], model.config().image_aspect_ratio, &Device::Cpu, DType::F32)
        .unwrap();
    let token = model.config().image_token_id;
    let ids = candle_core::Tensor::new(&[[1u32, token, 48, 49, 50]], &Device::Cpu).unwrap();
    let inputs = MultimodalInputs::from_ids(ids).with_images(pixels, vec![(12, 10)]);

    let a: Vec<Vec<f32>> = model
        .forward(&inputs, &ForwardOptions::default())
        .unwrap()
        .reward()
        .unwrap()
        .to_vec2()
        .unwrap();
    let b: Vec<Vec<f32>> = model
        .forward(&inputs, &ForwardOptions::default())
        .unwrap()
        .reward()
        .unwrap()
        .to_vec2()
        .unwrap();
    assert_eq!(a, b);
}

#[test]
fn explicit_conv_mode_and_strict_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let ckpt = write_tiny_checkpoint(dir.path()).unwrap();
    let model_path = ckpt.model_dir.to_str().unwrap();
    let image = ckpt.image_path.to_str().unwrap();

    let mut request = EvaluateRequest::new(model_path, image, "What is in this image?");
    request.conv_mode = Some("llava_llama_2");
    request.transfer_mode = TransferMode::Strict;
    let reward =
        evaluate_with(&request, &ModelRegistry::builtin(), &Device::Cpu, DType::F32).unwrap();
    assert!(reward.is_finite());

    request.conv_mode = Some("no_such_template");
    assert!(matches!(
        evaluate_with(&request, &ModelRegistry::builtin(), &Device::Cpu, DType::F32),
        Err(EvaluateError::UnknownTemplate(_))
    ));
}

#[test]
fn batched_rows_score_independently() {
    let dir = tempfile::tempdir().unwrap();
    let ckpt = write_tiny_checkpoint(dir.path()).unwrap();
    let request = LoadRequest::new(ckpt.model_dir.to_str().unwrap(), &Device::Cpu, DType::F32);
    let loaded = load_pretrained_model(&request, &ModelRegistry::builtin()).unwrap();
    let (model, report) = loaded.model.into_reward(TransferMode::Strict).unwrap();
    assert_eq!(report.unwrap().excluded, vec!["lm_head.weight"]);

    let img = load_image(ckpt.image_path.to_str().unwrap()).unwrap();
    let pixels = loaded
        .image_processor
        .process_images(
            &[img.clone(), img],
            model.config().image_aspect_ratio,
            &Device::Cpu,
            DType::F32,
        )
        .unwrap();

    let token = model.config().image_token_id;
    let ids = candle_core::Tensor::new(&[[1u32, token, 50, 51], [1, 52, token, 0]], &Device::Cpu)
        .unwrap();
    let mask = candle_core::Tensor::new(&[[1u32, 1, 1, 1], [1, 1, 1, 0]], &Device::Cpu).unwrap();
    let inputs = MultimodalInputs::from_ids(ids)
        .with_attention_mask(mask)
        .with_images(pixels, vec![(12, 10), (12, 10)]);

    let out = model.forward(&inputs, &ForwardOptions::default()).unwrap();
    let rewards: Vec<Vec<f32>> = out.reward().unwrap().to_vec2().unwrap();
    assert_eq!(rewards.len(), 2);
    assert!(rewards.iter().flatten().all(|r| r.is_finite()));
}

// ─── Scenario B ──────────────────────────────────────────────────────────────

#[test]
fn remote_404_is_an_acquisition_error() {
    let (url, server) = serve_once("HTTP/1.1 404 Not Found");
    let err = load_image(&url).unwrap_err();
    server.join().unwrap();
    assert!(matches!(
        err,
        ImageAcquisitionError::Status { status: 404, .. }
    ));
    assert!(err.to_string().contains("404"));
}

#[test]
fn remote_404_fails_the_evaluation() {
    let dir = tempfile::tempdir().unwrap();
    let ckpt = write_tiny_checkpoint(dir.path()).unwrap();
    let (url, server) = serve_once("HTTP/1.1 404 Not Found");

    let result = evaluate(
        ckpt.model_dir.to_str().unwrap(),
        &url,
        "What is in this image?",
        &Device::Cpu,
    );
    server.join().unwrap();
    assert!(matches!(
        result,
        Err(EvaluateError::Image(ImageAcquisitionError::Status { status: 404, .. }))
    ));
}

#[test]
fn refused_connection_is_a_fetch_error() {
    // bind then drop to get a port nothing listens on
    let addr = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();
    let err = load_image(&format!("http://{addr}/x.png")).unwrap_err();
    assert!(matches!(err, ImageAcquisitionError::Fetch { .. }));
}

#[test]
fn missing_checkpoint_is_a_load_error() {
    let dir = tempfile::tempdir().unwrap();
    let empty = dir.path().join("empty");
    std::fs::create_dir_all(&empty).unwrap();
    assert!(matches!(
        evaluate(empty.to_str().unwrap(), "img.png", "hi", &Device::Cpu),
        Err(EvaluateError::Load(_))
    ));
}
