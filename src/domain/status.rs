//! Status taxonomy for shipments, B2B shipments and B2B volumes
//!
//! Wire values are the upper-case tokens persisted in the database and sent in
//! webhooks. `label()` gives the pt-BR text shown to customers and drivers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a single (non-B2B) shipment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShipmentStatus {
    PendingLabel,
    LabelGenerated,
    PendingDocument,
    PendingPayment,
    PaymentConfirmed,
    ColetaAceita,
    ColetaFinalizada,
    EmTransito,
    EntregaFinalizada,
    /// Failed delivery attempt; the shipment will be retried
    TentativaEntrega,
    /// Stalled until an operator fixes the address
    EnderecoIncorreto,
    /// Stalled until the recipient is reachable
    AguardandoDestinatario,
}

impl ShipmentStatus {
    pub const ALL: [ShipmentStatus; 12] = [
        ShipmentStatus::PendingLabel,
        ShipmentStatus::LabelGenerated,
        ShipmentStatus::PendingDocument,
        ShipmentStatus::PendingPayment,
        ShipmentStatus::PaymentConfirmed,
        ShipmentStatus::ColetaAceita,
        ShipmentStatus::ColetaFinalizada,
        ShipmentStatus::EmTransito,
        ShipmentStatus::EntregaFinalizada,
        ShipmentStatus::TentativaEntrega,
        ShipmentStatus::EnderecoIncorreto,
        ShipmentStatus::AguardandoDestinatario,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ShipmentStatus::PendingLabel => "PENDING_LABEL",
            ShipmentStatus::LabelGenerated => "LABEL_GENERATED",
            ShipmentStatus::PendingDocument => "PENDING_DOCUMENT",
            ShipmentStatus::PendingPayment => "PENDING_PAYMENT",
            ShipmentStatus::PaymentConfirmed => "PAYMENT_CONFIRMED",
            ShipmentStatus::ColetaAceita => "COLETA_ACEITA",
            ShipmentStatus::ColetaFinalizada => "COLETA_FINALIZADA",
            ShipmentStatus::EmTransito => "EM_TRANSITO",
            ShipmentStatus::EntregaFinalizada => "ENTREGA_FINALIZADA",
            ShipmentStatus::TentativaEntrega => "TENTATIVA_ENTREGA",
            ShipmentStatus::EnderecoIncorreto => "ENDERECO_INCORRETO",
            ShipmentStatus::AguardandoDestinatario => "AGUARDANDO_DESTINATARIO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|status| status.as_str() == s)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ShipmentStatus::PendingLabel => "Aguardando etiqueta",
            ShipmentStatus::LabelGenerated => "Etiqueta gerada",
            ShipmentStatus::PendingDocument => "Aguardando documento fiscal",
            ShipmentStatus::PendingPayment => "Aguardando pagamento",
            ShipmentStatus::PaymentConfirmed => "Pagamento confirmado",
            ShipmentStatus::ColetaAceita => "Coleta aceita",
            ShipmentStatus::ColetaFinalizada => "Coleta finalizada",
            ShipmentStatus::EmTransito => "Em trânsito",
            ShipmentStatus::EntregaFinalizada => "Entrega finalizada",
            ShipmentStatus::TentativaEntrega => "Tentativa de entrega",
            ShipmentStatus::EnderecoIncorreto => "Endereço incorreto",
            ShipmentStatus::AguardandoDestinatario => "Aguardando destinatário",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ShipmentStatus::EntregaFinalizada)
    }

    /// Exception states that need an operator before the flow can continue
    pub fn is_stalled(&self) -> bool {
        matches!(
            self,
            ShipmentStatus::EnderecoIncorreto | ShipmentStatus::AguardandoDestinatario
        )
    }
}

impl fmt::Display for ShipmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored status of a B2B shipment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum B2bShipmentStatus {
    #[serde(rename = "PENDENTE")]
    Pendente,
    /// Collection accepted by a driver
    #[serde(rename = "ACEITA")]
    Aceita,
    #[serde(rename = "B2B_COLETA_FINALIZADA")]
    ColetaFinalizada,
    #[serde(rename = "B2B_ENTREGA_ACEITA")]
    EntregaAceita,
    #[serde(rename = "ENTREGUE")]
    Entregue,
    #[serde(rename = "CONCLUIDO")]
    Concluido,
    #[serde(rename = "CANCELADO")]
    Cancelado,
}

impl B2bShipmentStatus {
    pub const ALL: [B2bShipmentStatus; 7] = [
        B2bShipmentStatus::Pendente,
        B2bShipmentStatus::Aceita,
        B2bShipmentStatus::ColetaFinalizada,
        B2bShipmentStatus::EntregaAceita,
        B2bShipmentStatus::Entregue,
        B2bShipmentStatus::Concluido,
        B2bShipmentStatus::Cancelado,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            B2bShipmentStatus::Pendente => "PENDENTE",
            B2bShipmentStatus::Aceita => "ACEITA",
            B2bShipmentStatus::ColetaFinalizada => "B2B_COLETA_FINALIZADA",
            B2bShipmentStatus::EntregaAceita => "B2B_ENTREGA_ACEITA",
            B2bShipmentStatus::Entregue => "ENTREGUE",
            B2bShipmentStatus::Concluido => "CONCLUIDO",
            B2bShipmentStatus::Cancelado => "CANCELADO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|status| status.as_str() == s)
    }

    pub fn label(&self) -> &'static str {
        match self {
            B2bShipmentStatus::Pendente => "Aguardando motorista",
            B2bShipmentStatus::Aceita => "Coleta aceita",
            B2bShipmentStatus::ColetaFinalizada => "Coleta finalizada",
            B2bShipmentStatus::EntregaAceita => "Entrega aceita",
            B2bShipmentStatus::Entregue => "Entregue",
            B2bShipmentStatus::Concluido => "Concluído",
            B2bShipmentStatus::Cancelado => "Cancelado",
        }
    }
}

impl fmt::Display for B2bShipmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one physical B2B volume
///
/// Collection phase: `AguardandoAceiteColeta -> ColetaAceita -> Coletado`.
/// Delivery phase: `EmTriagem -> AguardandoAceiteExpedicao -> Expedido -> EmRota
/// -> Entregue -> Concluido`. `Devolucao` ends the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeStatus {
    AguardandoAceiteColeta,
    ColetaAceita,
    Coletado,
    EmTriagem,
    AguardandoAceiteExpedicao,
    Expedido,
    EmRota,
    Entregue,
    Concluido,
    Devolucao,
}

/// Which macro-phase a volume status belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumePhase {
    Collection,
    Delivery,
    Returned,
}

impl VolumeStatus {
    pub const ALL: [VolumeStatus; 10] = [
        VolumeStatus::AguardandoAceiteColeta,
        VolumeStatus::ColetaAceita,
        VolumeStatus::Coletado,
        VolumeStatus::EmTriagem,
        VolumeStatus::AguardandoAceiteExpedicao,
        VolumeStatus::Expedido,
        VolumeStatus::EmRota,
        VolumeStatus::Entregue,
        VolumeStatus::Concluido,
        VolumeStatus::Devolucao,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeStatus::AguardandoAceiteColeta => "AGUARDANDO_ACEITE_COLETA",
            VolumeStatus::ColetaAceita => "COLETA_ACEITA",
            VolumeStatus::Coletado => "COLETADO",
            VolumeStatus::EmTriagem => "EM_TRIAGEM",
            VolumeStatus::AguardandoAceiteExpedicao => "AGUARDANDO_ACEITE_EXPEDICAO",
            VolumeStatus::Expedido => "EXPEDIDO",
            VolumeStatus::EmRota => "EM_ROTA",
            VolumeStatus::Entregue => "ENTREGUE",
            VolumeStatus::Concluido => "CONCLUIDO",
            VolumeStatus::Devolucao => "DEVOLUCAO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|status| status.as_str() == s)
    }

    pub fn label(&self) -> &'static str {
        match self {
            VolumeStatus::AguardandoAceiteColeta => "Aguardando aceite da coleta",
            VolumeStatus::ColetaAceita => "Coleta aceita",
            VolumeStatus::Coletado => "Coletado",
            VolumeStatus::EmTriagem => "Em triagem",
            VolumeStatus::AguardandoAceiteExpedicao => "Aguardando aceite da expedição",
            VolumeStatus::Expedido => "Expedido",
            VolumeStatus::EmRota => "Em rota de entrega",
            VolumeStatus::Entregue => "Entregue",
            VolumeStatus::Concluido => "Concluído",
            VolumeStatus::Devolucao => "Devolução",
        }
    }

    pub fn phase(&self) -> VolumePhase {
        match self {
            VolumeStatus::AguardandoAceiteColeta
            | VolumeStatus::ColetaAceita
            | VolumeStatus::Coletado => VolumePhase::Collection,
            VolumeStatus::Devolucao => VolumePhase::Returned,
            _ => VolumePhase::Delivery,
        }
    }

    /// Delivered volumes count towards the completed aggregate
    pub fn is_delivered(&self) -> bool {
        matches!(self, VolumeStatus::Entregue | VolumeStatus::Concluido)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, VolumeStatus::Concluido | VolumeStatus::Devolucao)
    }
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values_round_trip_through_serde() {
        for status in ShipmentStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(ShipmentStatus::parse(status.as_str()), Some(status));
        }
        for status in B2bShipmentStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        for status in VolumeStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn test_volume_phases() {
        assert_eq!(VolumeStatus::ColetaAceita.phase(), VolumePhase::Collection);
        assert_eq!(VolumeStatus::EmRota.phase(), VolumePhase::Delivery);
        assert_eq!(VolumeStatus::Devolucao.phase(), VolumePhase::Returned);
        assert!(VolumeStatus::Entregue.is_delivered());
        assert!(VolumeStatus::Concluido.is_delivered());
        assert!(!VolumeStatus::EmRota.is_delivered());
    }

    #[test]
    fn test_labels() {
        assert_eq!(ShipmentStatus::EmTransito.label(), "Em trânsito");
        assert_eq!(B2bShipmentStatus::Concluido.label(), "Concluído");
        assert!(ShipmentStatus::EnderecoIncorreto.is_stalled());
        assert!(!ShipmentStatus::TentativaEntrega.is_stalled());
    }
}
