//! User-facing messages for foreground actions.
//!
//! Every failure a user can trigger maps to a [`UserMessage`]; views render it
//! in the configured [`Locale`] instead of showing raw error text.

use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Locale {
    #[default]
    Korean,
    English,
}

impl FromStr for Locale {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ko" | "ko-kr" | "korean" => Ok(Self::Korean),
            "en" | "en-us" | "english" => Ok(Self::English),
            other => Err(format!("Unknown locale: {}", other)),
        }
    }
}

/// Foreground actions that can fail in front of the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Login,
    Signup,
    Logout,
    SaveProfile,
    JoinFamily,
    CreateFamily,
    Sync,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserMessage {
    InvalidInviteCode,
    DuplicateInviteCode,
    InvalidCredentials,
    NotSignedIn,
    NotAllowed,
    TimedOut,
    Failed { action: Action, detail: String },
    SignupComplete,
    ConfirmEmail,
    ProfileSaved,
    JoinedFamily { name: String },
    FamilyCreated { name: String, invite_code: String },
    Synced,
    NotLinked,
    LoggedOut,
}

impl UserMessage {
    pub fn for_error(action: Action, err: &AppError) -> Self {
        match err {
            AppError::InvalidInviteCode(_) => Self::InvalidInviteCode,
            AppError::DuplicateInviteCode(_) => Self::DuplicateInviteCode,
            AppError::InvalidCredentials => Self::InvalidCredentials,
            AppError::Unauthenticated => Self::NotSignedIn,
            AppError::PolicyRejected(_) => Self::NotAllowed,
            AppError::Timeout { .. } => Self::TimedOut,
            AppError::InvalidInput(detail) | AppError::NotFound(detail) => Self::Failed {
                action,
                detail: detail.clone(),
            },
            AppError::Backend { message, .. } => Self::Failed {
                action,
                detail: message.clone(),
            },
            other => Self::Failed {
                action,
                detail: other.to_string(),
            },
        }
    }

    pub fn render(&self, locale: Locale) -> String {
        match locale {
            Locale::Korean => self.render_korean(),
            Locale::English => self.render_english(),
        }
    }

    fn render_korean(&self) -> String {
        match self {
            Self::InvalidInviteCode => "유효하지 않은 가족 코드입니다.".to_string(),
            Self::DuplicateInviteCode => "이미 사용 중인 가족 코드입니다.".to_string(),
            Self::InvalidCredentials => "이메일 또는 비밀번호가 올바르지 않습니다.".to_string(),
            Self::NotSignedIn => "로그인이 필요합니다.".to_string(),
            Self::NotAllowed => "이 작업을 수행할 권한이 없습니다.".to_string(),
            Self::TimedOut => {
                "서버 응답이 지연되고 있습니다. 잠시 후 다시 시도해주세요.".to_string()
            }
            Self::Failed { action, detail } => {
                let prefix = match action {
                    Action::Login => "로그인 실패",
                    Action::Signup => "회원가입 실패",
                    Action::Logout => "로그아웃 실패",
                    Action::SaveProfile => "저장 실패",
                    Action::JoinFamily => "가족 합류 실패",
                    Action::CreateFamily => "가족 만들기 실패",
                    Action::Sync => "동기화 실패",
                };
                format!("{}: {}", prefix, detail)
            }
            Self::SignupComplete => "회원가입이 완료되었습니다! 로그인해주세요.".to_string(),
            Self::ConfirmEmail => "이메일을 확인해 가입을 완료해주세요.".to_string(),
            Self::ProfileSaved => "프로필이 저장되었습니다.".to_string(),
            Self::JoinedFamily { name } => format!("{}에 합류했습니다.", name),
            Self::FamilyCreated { name, invite_code } => {
                format!("{}을(를) 만들었습니다. 가족 코드: {}", name, invite_code)
            }
            Self::Synced => "프로필을 다시 동기화했습니다.".to_string(),
            Self::NotLinked => {
                "아직 가족과 연결되지 않았습니다. 잠시 후 동기화해주세요.".to_string()
            }
            Self::LoggedOut => "로그아웃되었습니다.".to_string(),
        }
    }

    fn render_english(&self) -> String {
        match self {
            Self::InvalidInviteCode => "Invalid invite code.".to_string(),
            Self::DuplicateInviteCode => "That invite code is already in use.".to_string(),
            Self::InvalidCredentials => "Incorrect email or password.".to_string(),
            Self::NotSignedIn => "You need to sign in first.".to_string(),
            Self::NotAllowed => "You are not allowed to do that.".to_string(),
            Self::TimedOut => {
                "The server is taking too long to respond. Please try again.".to_string()
            }
            Self::Failed { action, detail } => {
                let prefix = match action {
                    Action::Login => "Login failed",
                    Action::Signup => "Sign-up failed",
                    Action::Logout => "Logout failed",
                    Action::SaveProfile => "Save failed",
                    Action::JoinFamily => "Could not join family",
                    Action::CreateFamily => "Could not create family",
                    Action::Sync => "Sync failed",
                };
                format!("{}: {}", prefix, detail)
            }
            Self::SignupComplete => "Sign-up complete! Please log in.".to_string(),
            Self::ConfirmEmail => "Check your email to confirm your account.".to_string(),
            Self::ProfileSaved => "Profile updated!".to_string(),
            Self::JoinedFamily { name } => format!("You joined {}.", name),
            Self::FamilyCreated { name, invite_code } => {
                format!("Created {}. Invite code: {}", name, invite_code)
            }
            Self::Synced => "Profile re-synced.".to_string(),
            Self::NotLinked => {
                "Not linked to a family yet. Try syncing again in a moment.".to_string()
            }
            Self::LoggedOut => "Logged out.".to_string(),
        }
    }
}

impl fmt::Display for UserMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(Locale::default()))
    }
}

/// Name given to a family created at signup without an explicit name.
pub fn default_family_name(locale: Locale, member_name: &str) -> String {
    match locale {
        Locale::Korean => format!("{}네 가족", member_name),
        Locale::English => format!("{}'s family", member_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locale_parsing() {
        assert_eq!("ko".parse::<Locale>().unwrap(), Locale::Korean);
        assert_eq!("EN".parse::<Locale>().unwrap(), Locale::English);
        assert!("fr".parse::<Locale>().is_err());
    }

    #[test]
    fn test_duplicate_and_invalid_code_messages_differ() {
        let invalid = UserMessage::for_error(
            Action::JoinFamily,
            &AppError::InvalidInviteCode("ABC123".to_string()),
        );
        let duplicate = UserMessage::for_error(
            Action::CreateFamily,
            &AppError::DuplicateInviteCode("ABC123".to_string()),
        );
        assert_eq!(invalid, UserMessage::InvalidInviteCode);
        assert_eq!(duplicate, UserMessage::DuplicateInviteCode);
        for locale in [Locale::Korean, Locale::English] {
            assert_ne!(invalid.render(locale), duplicate.render(locale));
        }
        assert_eq!(invalid.render(Locale::English), "Invalid invite code.");
    }

    #[test]
    fn test_backend_failure_keeps_action_prefix() {
        let err = AppError::Backend {
            status: 500,
            code: None,
            message: "boom".to_string(),
        };
        let msg = UserMessage::for_error(Action::Login, &err);
        assert_eq!(msg.render(Locale::Korean), "로그인 실패: boom");
        assert_eq!(msg.render(Locale::English), "Login failed: boom");
    }

    #[test]
    fn test_timeout_maps_to_timed_out() {
        let err = AppError::Timeout {
            description: "sign in".to_string(),
            after_ms: 10_000,
        };
        assert_eq!(
            UserMessage::for_error(Action::Login, &err),
            UserMessage::TimedOut
        );
    }

    #[test]
    fn test_default_family_name() {
        assert_eq!(default_family_name(Locale::Korean, "민수"), "민수네 가족");
        assert_eq!(default_family_name(Locale::English, "Min"), "Min's family");
    }
}
