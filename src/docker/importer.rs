use super::DockerError;
use bollard::Docker;
use futures::StreamExt;
use std::path::Path;

/// Load an image archive verbatim, returning the resulting image reference.
/// When a build specifies `import`, every other build field is ignored.
pub async fn import_image(client: &Docker, archive: &Path) -> Result<String, DockerError> {
    let contents = tokio::fs::read(archive)
        .await
        .map_err(|e| DockerError::Unknown(format!("cannot read {}: {e}", archive.display())))?;

    let mut stream = client.create_image(
        Some(bollard::image::CreateImageOptions::<String> {
            from_src: "-".to_string(),
            ..Default::default()
        }),
        Some(contents.into()),
        None,
    );

    let mut image_id = None;
    while let Some(progress) = stream.next().await {
        let info = progress.map_err(|e| {
            DockerError::Unknown(format!(
                "error importing image from archive file {}: {e}",
                archive.display()
            ))
        })?;
        if let Some(status) = info.status {
            image_id = Some(status);
        }
    }

    image_id.ok_or_else(|| {
        DockerError::Unknown(format!(
            "error importing image from archive file {}",
            archive.display()
        ))
    })
}
