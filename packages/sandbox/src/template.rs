// ABOUTME: Provisioning script renderer for sandbox images
// ABOUTME: Validates and shell-escapes every parameter before assembling the Dockerfile

use thiserror::Error;

/// Hostname prefix; the full hostname is `chunkhost-<sandbox_id>`
pub const HOSTNAME_PREFIX: &str = "chunkhost";

const MAX_IMAGE_REF_LEN: usize = 255;
const MAX_USERNAME_LEN: usize = 32;
const MAX_HOSTNAME_LEN: usize = 63;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Invalid value for {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, TemplateError>;

/// Cosmetic hardware profile shown by neofetch inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareProfile {
    pub os: String,
    pub host: String,
    pub kernel: String,
    pub cpu: String,
    pub memory: String,
    pub disk: String,
}

impl Default for HardwareProfile {
    fn default() -> Self {
        Self {
            os: "ChunkHost VPS".to_string(),
            host: "ChunkHost Virtual Server".to_string(),
            kernel: "Linux 6.1".to_string(),
            cpu: "AMD Ryzen 9".to_string(),
            memory: "32GB".to_string(),
            disk: "64GB".to_string(),
        }
    }
}

/// Everything the provisioning script is parameterized over.
///
/// All fields are treated as untrusted text.
#[derive(Clone, Copy)]
pub struct TemplateParams<'a> {
    pub base_image: &'a str,
    pub root_secret: &'a str,
    pub username: &'a str,
    pub user_secret: &'a str,
    pub welcome_text: &'a str,
    pub watermark_text: &'a str,
    pub sandbox_id: &'a str,
    pub hardware: &'a HardwareProfile,
}

/// Hostname assigned to a sandbox
pub fn hostname_for(sandbox_id: &str) -> String {
    format!("{}-{}", HOSTNAME_PREFIX, sandbox_id)
}

/// Render the provisioning script.
///
/// Structural fields (image, username, sandbox id) must match a strict
/// character set; free-text fields are single-quoted for the shell. Any value
/// containing a control character is rejected, since a newline would end the
/// Dockerfile instruction it sits in. Output is a pure function of the input.
pub fn render(params: &TemplateParams<'_>) -> Result<String> {
    let base_image = validate_image_ref(params.base_image)?;
    let username = validate_username(params.username)?;
    let sandbox_id = validate_sandbox_id(params.sandbox_id)?;
    let root_secret = validate_secret("root_secret", params.root_secret)?;
    let user_secret = validate_secret("user_secret", params.user_secret)?;
    let welcome = validate_text("welcome_text", params.welcome_text)?;
    let watermark = validate_text("watermark_text", params.watermark_text)?;
    let hardware = params.hardware;

    let root_credentials = shell_quote(&format!("root:{}", root_secret));
    let user_credentials = shell_quote(&format!("{}:{}", username, user_secret));
    let motd = shell_quote(welcome);
    let bashrc_greeting = shell_quote(&format!("echo {}", shell_quote(welcome)));
    let machine_info = shell_quote(watermark);
    let hostname = shell_quote(&hostname_for(sandbox_id));

    let neofetch_lines = [
        neofetch_info("OS", validate_text("hardware.os", &hardware.os)?),
        neofetch_info("Host", validate_text("hardware.host", &hardware.host)?),
        neofetch_info("Kernel", validate_text("hardware.kernel", &hardware.kernel)?),
        // Evaluated by neofetch at display time
        "    info \"Uptime\" \"$(uptime -p)\"".to_string(),
        neofetch_info("CPU", validate_text("hardware.cpu", &hardware.cpu)?),
        neofetch_info("Memory", validate_text("hardware.memory", &hardware.memory)?),
        neofetch_info("Disk", validate_text("hardware.disk", &hardware.disk)?),
    ];
    let neofetch_config = std::iter::once("print_info() {".to_string())
        .chain(neofetch_lines)
        .chain(std::iter::once("}".to_string()))
        .map(|line| format!("        {} \\", shell_quote(&line)))
        .collect::<Vec<_>>()
        .join("\n");

    // printf rather than echo: dash's echo rewrites backslash sequences.
    Ok(format!(
        r#"FROM {base_image}

ENV DEBIAN_FRONTEND=noninteractive

RUN apt-get update && \
    apt-get install -y systemd systemd-sysv dbus sudo \
                       curl gnupg2 apt-transport-https ca-certificates \
                       software-properties-common \
                       docker.io openssh-server tmate && \
    apt-get clean && rm -rf /var/lib/apt/lists/*

RUN printf '%s\n' {root_credentials} | chpasswd

RUN useradd -m -s /bin/bash {username} && \
    printf '%s\n' {user_credentials} | chpasswd && \
    usermod -aG sudo {username}

RUN mkdir -p /var/run/sshd && \
    sed -i 's/#PermitRootLogin prohibit-password/PermitRootLogin yes/' /etc/ssh/sshd_config && \
    sed -i 's/#PasswordAuthentication yes/PasswordAuthentication yes/' /etc/ssh/sshd_config

RUN systemctl enable ssh && \
    systemctl enable docker

RUN printf '%s\n' {motd} > /etc/motd && \
    printf '%s\n' {bashrc_greeting} >> /home/{username}/.bashrc && \
    printf '%s\n' {machine_info} > /etc/machine-info && \
    printf '%s\n' {hostname} > /etc/hostname

RUN apt-get update && \
    apt-get install -y neofetch htop nano vim wget git tmux net-tools dnsutils iputils-ping && \
    apt-get clean && \
    rm -rf /var/lib/apt/lists/*

RUN mkdir -p /etc/neofetch && \
    printf '%s\n' \
{neofetch_config}
        > /etc/neofetch/config.conf

STOPSIGNAL SIGRTMIN+3

CMD ["/sbin/init"]
"#
    ))
}

/// Wrap `value` in single quotes for POSIX shells
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Escape `value` for use inside a bash double-quoted string
fn bash_double_quote_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn neofetch_info(label: &str, value: &str) -> String {
    format!(
        "    info \"{}\" \"{}\"",
        label,
        bash_double_quote_escape(value)
    )
}

fn invalid(field: &'static str, reason: impl Into<String>) -> TemplateError {
    TemplateError::InvalidField {
        field,
        reason: reason.into(),
    }
}

fn reject_control_chars(field: &'static str, value: &str) -> Result<()> {
    match value.chars().find(|c| c.is_control()) {
        Some(c) => Err(invalid(
            field,
            format!("contains control character {:?}", c),
        )),
        None => Ok(()),
    }
}

fn validate_text<'v>(field: &'static str, value: &'v str) -> Result<&'v str> {
    reject_control_chars(field, value)?;
    // BuildKit reads `<<` on a RUN line as a heredoc marker, quoted or not
    if value.contains("<<") {
        return Err(invalid(field, "must not contain \"<<\""));
    }
    Ok(value)
}

fn validate_secret<'v>(field: &'static str, value: &'v str) -> Result<&'v str> {
    if value.is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    reject_control_chars(field, value)?;
    Ok(value)
}

fn validate_image_ref(value: &str) -> Result<&str> {
    const FIELD: &str = "base_image";
    if value.is_empty() || value.len() > MAX_IMAGE_REF_LEN {
        return Err(invalid(
            FIELD,
            format!("length must be 1-{}", MAX_IMAGE_REF_LEN),
        ));
    }
    if !value.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(invalid(FIELD, "must start with a letter or digit"));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':' | '/' | '@')))
    {
        return Err(invalid(FIELD, format!("character {:?} not allowed", c)));
    }
    Ok(value)
}

fn validate_username(value: &str) -> Result<&str> {
    const FIELD: &str = "username";
    if value.is_empty() || value.len() > MAX_USERNAME_LEN {
        return Err(invalid(
            FIELD,
            format!("length must be 1-{}", MAX_USERNAME_LEN),
        ));
    }
    if !value.starts_with(|c: char| c.is_ascii_lowercase() || c == '_') {
        return Err(invalid(FIELD, "must start with a lowercase letter or '_'"));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-')))
    {
        return Err(invalid(FIELD, format!("character {:?} not allowed", c)));
    }
    Ok(value)
}

fn validate_sandbox_id(value: &str) -> Result<&str> {
    const FIELD: &str = "sandbox_id";
    let max_len = MAX_HOSTNAME_LEN - HOSTNAME_PREFIX.len() - 1;
    if value.is_empty() || value.len() > max_len {
        return Err(invalid(FIELD, format!("length must be 1-{}", max_len)));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit()))
    {
        return Err(invalid(FIELD, format!("character {:?} not allowed", c)));
    }
    Ok(value)
}
