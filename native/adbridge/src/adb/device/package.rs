use std::{error::Error, path::Path};

use const_format::concatcp;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{AdbDevice, TransferOptions};
use crate::error::{BridgeError, Result};

const VIEW_ACTION: &str = "android.intent.action.VIEW";
const OPEN_LINK_PREFIX: &str = concatcp!("am start -a ", VIEW_ACTION, " -d ");

/// How `pm install` is invoked.
#[derive(Debug)]
pub struct InstallOptions {
    /// Replace an already installed package (`-r`).
    pub replace: bool,
    /// Allow a lower version code (`-d`).
    pub allow_downgrade: bool,
    /// Grant all runtime permissions (`-g`).
    pub grant_permissions: bool,
    /// Used for the staging upload.
    pub transfer: TransferOptions,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            replace: true,
            allow_downgrade: false,
            grant_permissions: false,
            transfer: TransferOptions::default(),
        }
    }
}

impl InstallOptions {
    fn pm_args(&self, remote_path: &str) -> Vec<String> {
        let mut args = vec!["install".to_string()];
        for (enabled, flag) in
            [(self.replace, "-r"), (self.allow_downgrade, "-d"), (self.grant_permissions, "-g")]
        {
            if enabled {
                args.push(flag.to_string());
            }
        }
        args.push(remote_path.to_string());
        args
    }
}

/// `pm` prints `Success` on the last line; anything else (usually `Failure [CODE]`) is an error.
fn check_pm_output(command: String, output: &[u8]) -> Result<String> {
    let output = String::from_utf8_lossy(output).trim().to_string();
    if output.lines().any(|line| line.trim() == "Success") {
        Ok(output)
    } else {
        Err(BridgeError::CommandFailed { command, output })
    }
}

impl AdbDevice {
    /// Installs a package that is already on the device.
    #[instrument(level = "debug", skip(self, options), fields(serial = %self.serial()), err)]
    pub async fn install_remote(
        &self,
        remote_path: &str,
        options: &InstallOptions,
    ) -> Result<String> {
        let args = options.pm_args(remote_path);
        let output = self.run_command("pm", &args).await?;
        debug!(output = %String::from_utf8_lossy(&output).trim(), "Package manager finished");
        check_pm_output(format!("pm {}", args.join(" ")), &output)
    }

    /// Uploads a local APK to the staging directory, installs it and removes the staged copy.
    ///
    /// Returns the package manager output. The staged file is removed even when the install
    /// fails; a failed cleanup is only logged.
    #[instrument(
        level = "debug",
        skip(self, cancel, options),
        fields(serial = %self.serial()),
        err
    )]
    pub async fn install_apk(
        &self,
        cancel: &CancellationToken,
        apk_path: &Path,
        mut options: InstallOptions,
    ) -> Result<String> {
        info!(path = %apk_path.display(), "Installing APK");
        let remote_path =
            format!("{}/{}.apk", self.server().install_dir.trim_end_matches('/'), Uuid::new_v4());
        let transfer = std::mem::take(&mut options.transfer);
        self.upload_file(cancel, apk_path, &remote_path, transfer).await?;

        let result = self.install_remote(&remote_path, &options).await;
        if let Err(e) = self.remove_file(&remote_path).await {
            warn!(error = &e as &dyn Error, remote_path, "Failed to remove staged APK");
        }
        if result.is_ok() {
            info!(path = %apk_path.display(), "APK installed");
        }
        result
    }

    /// Opens `url` with the default handler for `VIEW` intents.
    #[instrument(level = "debug", skip(self), fields(serial = %self.serial()), err)]
    pub async fn open_link(&self, url: &str) -> Result<()> {
        if url.is_empty() || url.contains(char::is_whitespace) {
            return Err(BridgeError::InvalidArgument(format!("invalid link {url:?}")));
        }
        let quoted = format!("'{}'", url.replace('\'', r"'\''"));
        let output = self.shell(&format!("{OPEN_LINK_PREFIX}{quoted}")).await?;
        if output.contains("Error:") {
            return Err(BridgeError::CommandFailed {
                command: format!("{OPEN_LINK_PREFIX}{quoted}"),
                output: output.trim().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::{adb::testing::*, error::ErrorKind};

    fn apk_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"PK\x03\x04fake-apk-contents").unwrap();
        file
    }

    fn staged(fake: &FakeServer, prefix: &str) -> Vec<String> {
        fake.requests().into_iter().filter(|r| r.starts_with(prefix)).collect()
    }

    #[test]
    fn pm_arguments_follow_options() {
        let opts = InstallOptions::default();
        assert_eq!(opts.pm_args("/tmp/a.apk"), ["install", "-r", "/tmp/a.apk"]);
        let opts = InstallOptions {
            replace: false,
            allow_downgrade: true,
            grant_permissions: true,
            ..Default::default()
        };
        assert_eq!(opts.pm_args("/tmp/a.apk"), ["install", "-d", "-g", "/tmp/a.apk"]);
        assert!(check_pm_output("pm".into(), b"Performing Streamed Install\nSuccess\n").is_ok());
        assert!(check_pm_output("pm".into(), b"").is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stages_installs_and_cleans_up() {
        let fake = FakeServer::start(
            FakeState::default()
                .with_device("SER1 offline")
                .with_shell(
                    "shell:pm install -r /data/local/tmp/",
                    "Performing Streamed Install\nSuccess\n",
                ),
        )
        .await;
        let device = fake.server().get_device("SER1").await.unwrap();
        let apk = apk_file();

        let output = device
            .install_apk(&CancellationToken::new(), apk.path(), InstallOptions::default())
            .await
            .unwrap();
        assert!(output.ends_with("Success"));

        let installs = staged(&fake, "shell:pm install -r /data/local/tmp/");
        assert_eq!(installs.len(), 1);
        let remote = installs[0].trim_start_matches("shell:pm install -r ").to_string();
        assert!(remote.ends_with(".apk"));
        assert_eq!(fake.file(&remote).unwrap(), b"PK\x03\x04fake-apk-contents");
        assert_eq!(staged(&fake, "shell:rm -f "), [format!("shell:rm -f {remote}")]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failure_still_removes_staged_file() {
        let fake = FakeServer::start(
            FakeState::default()
                .with_device("SER1 offline")
                .with_shell("shell:pm install -r ", "Failure [INSTALL_FAILED_INVALID_APK]\n"),
        )
        .await;
        let device = fake.server().get_device("SER1").await.unwrap();
        let apk = apk_file();

        let err = device
            .install_apk(&CancellationToken::new(), apk.path(), InstallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Command);
        assert_eq!(err.diagnostic(), Some("Failure [INSTALL_FAILED_INVALID_APK]"));
        assert_eq!(staged(&fake, "shell:rm -f ").len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_local_apk_never_touches_device() {
        let fake = FakeServer::start(FakeState::default().with_device("SER1 offline")).await;
        let device = fake.server().get_device("SER1").await.unwrap();
        let err = device
            .install_apk(
                &CancellationToken::new(),
                Path::new("/definitely/not/here.apk"),
                InstallOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LocalIo);
        assert!(staged(&fake, "sync:").is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn opens_links_quoted() {
        let fake = FakeServer::start(FakeState::default().with_device("SER1 offline")).await;
        let device = fake.server().get_device("SER1").await.unwrap();
        device.open_link("https://example.com/?a=1&b=2").await.unwrap();
        assert!(fake.requests().contains(
            &"shell:am start -a android.intent.action.VIEW -d 'https://example.com/?a=1&b=2'".to_string()
        ));
        let err = device.open_link("not a link").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
