//! Derived-code regeneration.
//!
//! Two generators exist per service: protobuf code produced by `protoc` from
//! the shared `protos/` directory, and schema artifacts produced by a
//! descriptor-supplied command. Both run to completion with their output
//! streamed to the log sink, and neither touches the lifecycle state machine.

use crate::config::{Descriptor, PROTO_OUTPUT_DIR};
use crate::error::{Error, Result};
use crate::supervisor::process::run_streamed;

/// Regenerate the service's protobuf code.
///
/// No-op for services without declared proto inputs.
pub async fn generate_protos(descriptor: &Descriptor) -> Result<()> {
    if descriptor.protos.is_empty() {
        return Ok(());
    }

    tracing::info!(service = %descriptor.name, "Generating protobuf code...");

    // protoc refuses to write into a missing directory
    std::fs::create_dir_all(descriptor.proto_output_dir())?;

    let mut argv = vec![
        "protoc".to_string(),
        format!("--proto_path={}", descriptor.protos_dir().display()),
        format!("--prost_out={PROTO_OUTPUT_DIR}"),
    ];
    argv.extend(descriptor.protos.iter().cloned());

    let status = run_streamed(&descriptor.name, &argv, &descriptor.dir, &descriptor.env).await?;
    if !status.success() {
        return Err(Error::Generate(
            descriptor.name.clone(),
            format!("protoc exited with {status}"),
        ));
    }
    Ok(())
}

/// Regenerate the service's schema artifacts.
///
/// No-op for services without a configured schema command.
pub async fn generate_schema(descriptor: &Descriptor) -> Result<()> {
    let Some(argv) = &descriptor.schema_command else {
        return Ok(());
    };

    tracing::info!(service = %descriptor.name, "Generating schema code...");

    let status = run_streamed(&descriptor.name, argv, &descriptor.dir, &descriptor.env).await?;
    if !status.success() {
        return Err(Error::Generate(
            descriptor.name.clone(),
            format!("schema command exited with {status}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn descriptor(dir: &std::path::Path) -> Descriptor {
        Descriptor {
            name: "gen-test".to_string(),
            root: dir.to_path_buf(),
            dir: dir.to_path_buf(),
            folders: vec![],
            dependencies: vec![],
            run: None,
            install: vec![],
            env: HashMap::new(),
            protos: vec![],
            schema_command: None,
            status_port: 0,
        }
    }

    #[tokio::test]
    async fn no_proto_inputs_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        generate_protos(&descriptor(tmp.path())).await.unwrap();
    }

    #[tokio::test]
    async fn schema_command_runs_in_service_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let mut desc = descriptor(tmp.path());
        desc.schema_command = Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo generated > schema.out".to_string(),
        ]);

        generate_schema(&desc).await.unwrap();
        assert!(tmp.path().join("schema.out").is_file());
    }

    #[tokio::test]
    async fn failing_schema_command_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let mut desc = descriptor(tmp.path());
        desc.schema_command = Some(vec!["sh".to_string(), "-c".to_string(), "exit 2".to_string()]);

        let result = generate_schema(&desc).await;
        assert!(matches!(result, Err(Error::Generate(_, _))));
    }
}
