//! Canned call phrases, localized per supported language.
//!
//! These are spoken through the platform's own TTS, so they must work even
//! when every backend is down. The apology line is the terminal fallback
//! and goes out exactly once, with no retry.
//!
//! Operators can replace any phrase per language through
//! `[business.phrases.<lang>]`; the book resolves overrides once at
//! startup. A phrase without an override keeps the built-in wording for
//! that language, never the primary language's text, so a partially
//! translated config still answers every caller in their own language.

use crate::config::{BusinessConfig, PhraseOverrides};
use crate::locale::Locale;

// ── Phrase book ────────────────────────────────────────────────────

/// Phrase set for one language, business name and config overrides
/// already applied.
#[derive(Debug, Clone)]
pub struct LocalePhrases {
    pub greeting: String,
    pub reprompts: Vec<String>,
    pub downgrade_notice: String,
    pub busy: String,
    pub apology: String,
    pub farewell: String,
    pub textonly_reply: String,
}

impl LocalePhrases {
    fn resolve(locale: Locale, business: &BusinessConfig) -> Self {
        let mut set = Self {
            greeting: greeting(locale, &business.name),
            reprompts: reprompts(locale).iter().map(|s| (*s).to_owned()).collect(),
            downgrade_notice: downgrade_notice(locale).to_owned(),
            busy: busy(locale).to_owned(),
            apology: apology(locale).to_owned(),
            farewell: farewell(locale).to_owned(),
            textonly_reply: textonly_reply(locale, &business.name, &business.facts),
        };
        if let Some(over) = business.phrases.get(locale.as_str()) {
            set.apply(over, &business.name);
        }
        set
    }

    fn apply(&mut self, over: &PhraseOverrides, name: &str) {
        let fill = |text: &str| text.replace("{name}", name);
        if let Some(text) = &over.greeting {
            self.greeting = fill(text);
        }
        // An empty list would leave the re-prompt rotation with nothing
        // to say, so it is ignored.
        if let Some(list) = &over.reprompts {
            if !list.is_empty() {
                self.reprompts = list.iter().map(|s| fill(s)).collect();
            }
        }
        if let Some(text) = &over.downgrade_notice {
            self.downgrade_notice = fill(text);
        }
        if let Some(text) = &over.busy {
            self.busy = fill(text);
        }
        if let Some(text) = &over.apology {
            self.apology = fill(text);
        }
        if let Some(text) = &over.farewell {
            self.farewell = fill(text);
        }
        if let Some(text) = &over.textonly_reply {
            self.textonly_reply = fill(text);
        }
    }
}

/// Resolved phrase sets for every supported language.
pub struct PhraseBook {
    sets: [LocalePhrases; 6],
}

impl PhraseBook {
    pub fn new(business: &BusinessConfig) -> Self {
        Self {
            sets: Locale::all().map(|locale| LocalePhrases::resolve(locale, business)),
        }
    }

    // `Locale::all()` lists variants in declaration order, so the
    // discriminant indexes the matching slot.
    fn set(&self, locale: Locale) -> &LocalePhrases {
        &self.sets[locale as usize]
    }

    pub fn greeting(&self, locale: Locale) -> &str {
        &self.set(locale).greeting
    }

    pub fn reprompts(&self, locale: Locale) -> &[String] {
        &self.set(locale).reprompts
    }

    pub fn downgrade_notice(&self, locale: Locale) -> &str {
        &self.set(locale).downgrade_notice
    }

    pub fn busy(&self, locale: Locale) -> &str {
        &self.set(locale).busy
    }

    pub fn apology(&self, locale: Locale) -> &str {
        &self.set(locale).apology
    }

    pub fn farewell(&self, locale: Locale) -> &str {
        &self.set(locale).farewell
    }

    pub fn textonly_reply(&self, locale: Locale) -> &str {
        &self.set(locale).textonly_reply
    }
}

// ── Built-in text ──────────────────────────────────────────────────

fn greeting(locale: Locale, business: &str) -> String {
    match locale {
        Locale::En => format!("Hello, thank you for calling {business}. How can I help you today?"),
        Locale::Es => format!("Hola, gracias por llamar a {business}. ¿En qué puedo ayudarle?"),
        Locale::Fr => format!("Bonjour, merci d'appeler {business}. Comment puis-je vous aider ?"),
        Locale::De => {
            format!("Hallo, danke für Ihren Anruf bei {business}. Wie kann ich Ihnen helfen?")
        }
        Locale::It => format!("Salve, grazie per aver chiamato {business}. Come posso aiutarla?"),
        Locale::Pt => format!("Olá, obrigado por ligar para {business}. Como posso ajudar?"),
    }
}

/// Re-prompt variants after silent input; the manager rotates through them.
fn reprompts(locale: Locale) -> &'static [&'static str] {
    match locale {
        Locale::En => &[
            "Sorry, I didn't catch that. Could you say it again?",
            "I didn't hear anything. How can I help?",
        ],
        Locale::Es => &[
            "Perdone, no le he entendido. ¿Puede repetirlo?",
            "No he oído nada. ¿En qué puedo ayudarle?",
        ],
        Locale::Fr => &[
            "Pardon, je n'ai pas compris. Pouvez-vous répéter ?",
            "Je n'ai rien entendu. Comment puis-je vous aider ?",
        ],
        Locale::De => &[
            "Entschuldigung, das habe ich nicht verstanden. Können Sie das wiederholen?",
            "Ich habe nichts gehört. Wie kann ich helfen?",
        ],
        Locale::It => &[
            "Scusi, non ho capito. Può ripetere?",
            "Non ho sentito nulla. Come posso aiutarla?",
        ],
        Locale::Pt => &[
            "Desculpe, não entendi. Pode repetir?",
            "Não ouvi nada. Como posso ajudar?",
        ],
    }
}

/// Spoken when the call steps down a tier but keeps going.
fn downgrade_notice(locale: Locale) -> &'static str {
    match locale {
        Locale::En => "Sorry, we're having a technical issue. Let's keep going in a simpler way.",
        Locale::Es => "Perdone, tenemos un problema técnico. Continuemos de forma más sencilla.",
        Locale::Fr => "Désolé, nous avons un souci technique. Continuons plus simplement.",
        Locale::De => "Entschuldigung, wir haben ein technisches Problem. Machen wir einfacher weiter.",
        Locale::It => "Scusi, abbiamo un problema tecnico. Continuiamo in modo più semplice.",
        Locale::Pt => "Desculpe, estamos com um problema técnico. Vamos continuar de forma mais simples.",
    }
}

/// Played to a new caller when the registry is full.
fn busy(locale: Locale) -> &'static str {
    match locale {
        Locale::En => "All our lines are busy right now. Please call back in a few minutes.",
        Locale::Es => "Todas nuestras líneas están ocupadas. Por favor, llame de nuevo en unos minutos.",
        Locale::Fr => "Toutes nos lignes sont occupées. Veuillez rappeler dans quelques minutes.",
        Locale::De => "Alle Leitungen sind gerade belegt. Bitte rufen Sie in ein paar Minuten wieder an.",
        Locale::It => "Tutte le nostre linee sono occupate. La preghiamo di richiamare tra qualche minuto.",
        Locale::Pt => "Todas as nossas linhas estão ocupadas. Por favor, ligue novamente em alguns minutos.",
    }
}

/// Terminal apology, platform TTS only.
fn apology(locale: Locale) -> &'static str {
    match locale {
        Locale::En => {
            "I'm sorry, I'm having trouble connecting you with the assistant. Please try again later."
        }
        Locale::Es => {
            "Lo siento, tengo problemas para conectarle con el asistente. Por favor, inténtelo más tarde."
        }
        Locale::Fr => {
            "Je suis désolé, je n'arrive pas à vous mettre en relation avec l'assistant. Veuillez réessayer plus tard."
        }
        Locale::De => {
            "Es tut mir leid, ich kann Sie gerade nicht mit dem Assistenten verbinden. Bitte versuchen Sie es später erneut."
        }
        Locale::It => {
            "Mi dispiace, ho problemi a collegarla con l'assistente. La preghiamo di riprovare più tardi."
        }
        Locale::Pt => {
            "Desculpe, estou com problemas para conectá-lo ao assistente. Por favor, tente novamente mais tarde."
        }
    }
}

fn farewell(locale: Locale) -> &'static str {
    match locale {
        Locale::En => "Goodbye, thank you for calling.",
        Locale::Es => "Adiós, gracias por su llamada.",
        Locale::Fr => "Au revoir, merci de votre appel.",
        Locale::De => "Auf Wiedersehen, danke für Ihren Anruf.",
        Locale::It => "Arrivederci, grazie per la chiamata.",
        Locale::Pt => "Tchau, obrigado pela ligação.",
    }
}

/// Static reply for the text-only tier: basic facts, nothing generative.
fn textonly_reply(locale: Locale, business: &str, facts: &[String]) -> String {
    let intro = match locale {
        Locale::En => format!("I can only share basic information about {business} right now."),
        Locale::Es => {
            format!("Ahora mismo solo puedo darle información básica sobre {business}.")
        }
        Locale::Fr => {
            format!("Je ne peux vous donner que des informations de base sur {business} pour le moment.")
        }
        Locale::De => {
            format!("Ich kann Ihnen im Moment nur grundlegende Informationen zu {business} geben.")
        }
        Locale::It => {
            format!("Al momento posso darle solo informazioni di base su {business}.")
        }
        Locale::Pt => {
            format!("No momento só posso dar informações básicas sobre {business}.")
        }
    };
    let outro = match locale {
        Locale::En => "Is there anything else?",
        Locale::Es => "¿Algo más?",
        Locale::Fr => "Autre chose ?",
        Locale::De => "Sonst noch etwas?",
        Locale::It => "Altro?",
        Locale::Pt => "Mais alguma coisa?",
    };
    if facts.is_empty() {
        format!("{intro} {outro}")
    } else {
        format!("{intro} {}. {outro}", facts.join(". "))
    }
}
