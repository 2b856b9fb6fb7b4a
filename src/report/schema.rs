//! レポート種別ごとのカノニカルスキーマ
//!
//! ポータルのバージョンによって見出しが変わるため、各カラムは複数の別名を持つ。

use super::types::ReportKind;

/// パーティションキー（全テーブル共通）
pub const REPORT_DATE_COLUMN: &str = "report_date";

/// カノニカルカラムの型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Number,
    Date,
}

impl ColumnType {
    /// ウェアハウス（BigQuery）上の型名
    pub fn warehouse_type(&self) -> &'static str {
        match self {
            ColumnType::Text => "STRING",
            ColumnType::Number => "FLOAT64",
            ColumnType::Date => "DATE",
        }
    }

    /// デプロイ済みの型と互換性があるか
    pub fn accepts(&self, deployed: &str) -> bool {
        let deployed = deployed.trim().to_ascii_uppercase();
        match self {
            ColumnType::Text => deployed == "STRING",
            ColumnType::Number => matches!(
                deployed.as_str(),
                "FLOAT64" | "FLOAT" | "NUMERIC" | "BIGNUMERIC"
            ),
            ColumnType::Date => deployed == "DATE",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Number => "number",
            ColumnType::Date => "date",
        }
    }
}

/// カノニカルカラム定義
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub ty: ColumnType,
    /// CSV見出しの別名（比較時に大小文字・アクセント・空白を無視）
    pub aliases: &'static [&'static str],
    pub required: bool,
}

impl ColumnSpec {
    const fn required(
        name: &'static str,
        ty: ColumnType,
        aliases: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            ty,
            aliases,
            required: true,
        }
    }

    const fn optional(
        name: &'static str,
        ty: ColumnType,
        aliases: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            ty,
            aliases,
            required: false,
        }
    }

    /// CSVから読まずに実行時に付与するカラムか
    pub fn is_stamped(&self) -> bool {
        self.name == REPORT_DATE_COLUMN
    }
}

const REPORT_DATE: ColumnSpec = ColumnSpec::required(REPORT_DATE_COLUMN, ColumnType::Date, &[]);

const MEDIA: &[ColumnSpec] = &[
    REPORT_DATE,
    ColumnSpec::required("media_id", ColumnType::Text, &["ID da Mídia", "Mídia ID", "ID"]),
    ColumnSpec::optional("media_name", ColumnType::Text, &["Mídia", "Nome da Mídia", "Nome"]),
    ColumnSpec::required("impressions", ColumnType::Number, &["Impressões", "Visualizações"]),
    ColumnSpec::required("clicks", ColumnType::Number, &["Cliques"]),
    ColumnSpec::optional("registrations", ColumnType::Number, &["Registros", "Cadastros"]),
    ColumnSpec::optional("first_deposits", ColumnType::Number, &["FTD", "FTDs", "Primeiros Depósitos"]),
];

const REGISTROS: &[ColumnSpec] = &[
    REPORT_DATE,
    ColumnSpec::required("player_id", ColumnType::Text, &["ID do Jogador", "Jogador", "ID"]),
    ColumnSpec::required("registered_on", ColumnType::Date, &["Data de Registro", "Data de Cadastro", "Data"]),
    ColumnSpec::optional("country", ColumnType::Text, &["País"]),
    ColumnSpec::optional("media_id", ColumnType::Text, &["ID da Mídia", "Mídia"]),
];

const GANHOS: &[ColumnSpec] = &[
    REPORT_DATE,
    ColumnSpec::required("commission_type", ColumnType::Text, &["Tipo de Comissão", "Tipo", "Plano"]),
    ColumnSpec::required("amount", ColumnType::Number, &["Valor", "Ganhos", "Comissão"]),
    ColumnSpec::optional("currency", ColumnType::Text, &["Moeda"]),
];

const ATIVIDADES: &[ColumnSpec] = &[
    REPORT_DATE,
    ColumnSpec::required("player_id", ColumnType::Text, &["ID do Jogador", "Jogador", "ID"]),
    ColumnSpec::required("deposits", ColumnType::Number, &["Depósitos", "Total de Depósitos"]),
    ColumnSpec::required("withdrawals", ColumnType::Number, &["Saques", "Total de Saques"]),
    ColumnSpec::optional("net_gaming_revenue", ColumnType::Number, &["NGR", "Receita Líquida"]),
];

pub fn columns_for(kind: ReportKind) -> &'static [ColumnSpec] {
    match kind {
        ReportKind::Media => MEDIA,
        ReportKind::Registros => REGISTROS,
        ReportKind::Ganhos => GANHOS,
        ReportKind::Atividades => ATIVIDADES,
    }
}

/// 見出し比較用に正規化（小文字化・アクセント除去・空白圧縮）
pub fn fold_header(header: &str) -> String {
    let folded: String = header
        .trim_start_matches('\u{feff}')
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' | 'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' | 'É' | 'È' | 'Ê' | 'Ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' | 'Í' | 'Ì' | 'Î' | 'Ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' | 'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' | 'Ú' | 'Ù' | 'Û' | 'Ü' => 'u',
            'ç' | 'Ç' => 'c',
            c => c.to_ascii_lowercase(),
        })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}
